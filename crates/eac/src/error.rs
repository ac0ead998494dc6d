//! Error types for the EAC/PACE protocol engine
//!
//! The taxonomy separates outcomes a caller can recover from (wrong password
//! with retries left, suspended PIN) from outcomes that end the session
//! (malformed encodings, failed authentications, blocked passwords). Use
//! [`Error::is_fatal`] and [`Error::retry_counter`] instead of matching
//! variants when only that distinction matters.

use crate::dispatch::ProtocolFunction;

/// Result type for EAC operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for the EAC/PACE protocol engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ------------------- Codec errors (always fatal) -------------------
    /// TLV or ASN.1 structure is syntactically invalid
    #[error("Malformed encoding: {0}")]
    MalformedEncoding(&'static str),

    /// Object identifier is empty, overflows, or violates X.690 arc rules
    #[error("Invalid object identifier: {0}")]
    InvalidOid(&'static str),

    // ------------------- Certificate errors (fatal) -------------------
    /// Card-verifiable certificate violates its structural template
    #[error("Certificate format error: {0}")]
    CertificateFormat(&'static str),

    /// Certificate chain fails CAR/CHR linkage or role checks
    #[error("Certificate chain invalid: {0}")]
    CertificateChainInvalid(&'static str),

    /// A chain certificate is outside its validity period
    #[error("Certificate expired or not yet effective")]
    CertificateExpired,

    /// No issuer could be resolved before the lookup budget ran out
    #[error("Certificate chain incomplete")]
    ChainIncomplete,

    // ------------------- Protocol crypto errors (fatal) -------------------
    /// Mutual authentication token comparison failed
    #[error("Authentication token mismatch")]
    AuthenticationTokenMismatch,

    /// Terminal authentication was rejected by the card
    #[error("Terminal authentication failed: {0}")]
    TerminalAuthenticationFailed(&'static str),

    /// Chip authentication failed; the session must be torn down
    #[error("Chip authentication failed: {0}")]
    ChipAuthenticationFailed(&'static str),

    /// Both sides presented the same ephemeral key
    #[error("Terminal and chip Diffie-Hellman keys are equal")]
    DiffieHellmanKeysEqual,

    /// Card advertises domain parameters this implementation does not carry
    #[error("Unsupported domain parameters (id {0})")]
    UnsupportedDomainParameters(i32),

    /// Card advertises a protocol OID this implementation does not speak
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    // ------------------- Password outcomes -------------------
    /// Wrong password; the low nibble of SW2 carried the remaining tries.
    /// Recoverable: the caller may re-prompt.
    #[error("Wrong password, {0} retries remaining")]
    WrongPasswordRetryCounter(u8),

    /// PIN is suspended (one try left); a CAN presentation is required first
    #[error("Password suspended, CAN required before the last retry")]
    PasswordSuspended,

    /// Password is blocked; only an unblocking flow (PUK) can help
    #[error("Password blocked")]
    PasswordBlocked,

    /// The eID function of the card is deactivated
    #[error("Card deactivated")]
    CardDeactivated,

    // ------------------- Dispatch / state errors -------------------
    /// The active protocol does not support the invoked function
    #[error("Protocol does not support {0}")]
    InappropriateProtocolForAction(ProtocolFunction),

    /// An operation was invoked in a protocol state that does not allow it
    #[error("Invalid protocol state: {0}")]
    InvalidProtocolState(&'static str),

    // ------------------- Lower layers -------------------
    /// Transport or APDU-level failure, underlying cause preserved
    #[error("Dispatch failure: {0}")]
    DispatchFailure(#[from] perso_apdu_core::Error),

    /// Secure messaging wrap/unwrap failure
    #[error("Secure messaging error: {0}")]
    SecureMessaging(&'static str),

    /// Padding of a decrypted cryptogram is invalid
    #[error("Cryptogram padding invalid")]
    Unpad(#[from] cipher::block_padding::UnpadError),

    /// Key material or cipher parameter error
    #[error("Cryptographic failure: {0}")]
    Crypto(&'static str),
}

impl Error {
    /// Remaining password tries, when this error carries that information
    pub const fn retry_counter(&self) -> Option<u8> {
        match self {
            Self::WrongPasswordRetryCounter(n) => Some(*n),
            Self::PasswordSuspended => Some(1),
            Self::PasswordBlocked => Some(0),
            _ => None,
        }
    }

    /// Whether this outcome ends the session.
    ///
    /// Recoverable outcomes are the wrong-password family (the caller may
    /// re-prompt within the remaining tries) and the suspended state (CAN
    /// unlocks the last try). Everything else requires a fresh session.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::WrongPasswordRetryCounter(_)
                | Self::PasswordSuspended
                | Self::InappropriateProtocolForAction(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_counter_accessor() {
        assert_eq!(Error::WrongPasswordRetryCounter(2).retry_counter(), Some(2));
        assert_eq!(Error::PasswordSuspended.retry_counter(), Some(1));
        assert_eq!(Error::PasswordBlocked.retry_counter(), Some(0));
        assert_eq!(Error::CardDeactivated.retry_counter(), None);
    }

    #[test]
    fn test_fatality_split() {
        assert!(!Error::WrongPasswordRetryCounter(1).is_fatal());
        assert!(!Error::PasswordSuspended.is_fatal());
        assert!(Error::PasswordBlocked.is_fatal());
        assert!(Error::AuthenticationTokenMismatch.is_fatal());
        assert!(Error::MalformedEncoding("tag").is_fatal());
        assert!(Error::CardDeactivated.is_fatal());
    }
}
