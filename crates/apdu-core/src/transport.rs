//! Transport layer for card communication
//!
//! [`CardTransport`] is the single injected I/O seam of this stack: everything
//! above it (secure channels, executors, protocol steps) drives raw APDU bytes
//! through this trait and performs no other I/O. A scripted implementation is
//! all that is needed to test a full protocol run.

use std::fmt;

use bytes::Bytes;

use crate::error::Error;
use crate::secure::SecurityLevel;

/// Trait for card transport connections
///
/// Implementors provide raw transmit and reset; they have no knowledge of
/// command structure or protocol state. Secure channel transports override
/// [`CardTransport::security_level`] to report their active protection.
pub trait CardTransport: fmt::Debug + Send {
    /// Send a raw command APDU and return the raw response (including the
    /// trailing status word)
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error>;

    /// Reset the transport
    fn reset(&mut self) -> Result<(), Error>;

    /// Security properties this transport applies to traffic
    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::none()
    }
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error> {
        (**self).transmit_raw(command)
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }

    fn security_level(&self) -> SecurityLevel {
        (**self).security_level()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Mock transport returning queued responses in order
    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        /// Responses to return, consumed front to back
        pub responses: Vec<Bytes>,
        /// Commands received so far
        pub commands: Vec<Bytes>,
    }

    impl MockTransport {
        pub(crate) fn new(responses: Vec<Bytes>) -> Self {
            Self {
                responses,
                commands: Vec::new(),
            }
        }

        pub(crate) fn with_response(response: Bytes) -> Self {
            Self::new(vec![response])
        }
    }

    impl CardTransport for MockTransport {
        fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error> {
            self.commands.push(Bytes::copy_from_slice(command));
            if self.responses.is_empty() {
                return Err(Error::TransmissionFailed);
            }
            Ok(self.responses.remove(0))
        }

        fn reset(&mut self) -> Result<(), Error> {
            self.commands.clear();
            Ok(())
        }
    }
}
