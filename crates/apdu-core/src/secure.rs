//! Secure channel abstractions
//!
//! A secure channel is a [`CardTransport`] layered over another transport: it
//! protects commands on the way down and verifies/unwraps responses on the
//! way up. [`SecurityLevel`] describes which protections are currently
//! active, so callers can gate commands on the protection they require.

use crate::error::Error;
use crate::transport::CardTransport;

/// Security properties currently applied to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityLevel {
    /// Whether commands and responses are encrypted
    pub encryption: bool,
    /// Whether commands and responses are MAC-protected
    pub integrity: bool,
    /// Whether the peer has been authenticated (password knowledge proven,
    /// or certificate-based authentication completed)
    pub authentication: bool,
}

impl SecurityLevel {
    /// Create a new security level
    pub const fn new(encryption: bool, integrity: bool, authentication: bool) -> Self {
        Self {
            encryption,
            integrity,
            authentication,
        }
    }

    /// No protection (plain communication)
    pub const fn none() -> Self {
        Self::new(false, false, false)
    }

    /// MAC protection only
    pub const fn mac() -> Self {
        Self::new(false, true, false)
    }

    /// Encryption with MAC protection
    pub const fn enc_mac() -> Self {
        Self::new(true, true, false)
    }

    /// Encryption and MAC protection with an authenticated peer
    pub const fn authenticated_enc_mac() -> Self {
        Self::new(true, true, true)
    }

    /// Check if this level provides at least the protections of `required`
    pub const fn satisfies(&self, required: &Self) -> bool {
        (self.encryption || !required.encryption)
            && (self.integrity || !required.integrity)
            && (self.authentication || !required.authentication)
    }

    /// Check if no protection is active
    pub const fn is_none(&self) -> bool {
        !self.encryption && !self.integrity && !self.authentication
    }
}

/// Trait for secure channel implementations
pub trait SecureChannel: CardTransport {
    /// Underlying transport type
    type UnderlyingTransport: CardTransport;

    /// Get the inner transport
    fn transport(&self) -> &Self::UnderlyingTransport;

    /// Get the mutable inner transport
    fn transport_mut(&mut self) -> &mut Self::UnderlyingTransport;

    /// Establish the secure channel
    fn open(&mut self) -> Result<(), Error>;

    /// Check if the secure channel is established
    fn is_established(&self) -> bool;

    /// Tear down the secure channel, discarding session keys
    fn close(&mut self) -> Result<(), Error>;

    /// Get the current security level
    fn security_level(&self) -> SecurityLevel;
}
