//! PIN comparison against card-held reference data, TR-03112 part 7.
//!
//! The simplest of the authentication protocols: one VERIFY inside the
//! channel PACE established. The digits either come from the caller, in
//! buffers that are scrubbed on every path out of the exchange, or stay on
//! the reader entirely when it has its own pad. Wrong digits surface with
//! the card's remaining tries so the caller can prompt again.

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use perso_apdu_core::{CardExecutor, CardTransport, Executor};

use crate::commands::{PasswordType, Verify};
use crate::error::{Error, Result};
use crate::secure_messaging::EacSecureChannel;

/// Where the comparison digits come from
pub enum PinInput {
    /// Digits supplied by the caller, scrubbed once the exchange is over
    Digits(Zeroizing<Vec<u8>>),
    /// The reader collects the digits on its own pad
    Pinpad,
}

impl PinInput {
    /// Take the caller's digit buffer, scrubbing the original in place
    pub fn digits(buffer: &mut [u8]) -> Self {
        let taken = Zeroizing::new(buffer.to_vec());
        buffer.zeroize();
        Self::Digits(taken)
    }
}

impl core::fmt::Debug for PinInput {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Digits(_) => f.write_str("Digits(..)"),
            Self::Pinpad => f.write_str("Pinpad"),
        }
    }
}

/// The PIN comparison step over a secure channel executor.
///
/// Defaults to the eID PIN reference. The pinpad variant sends the bare
/// VERIFY template for the reader firmware to complete with user-entered
/// digits; it is refused upfront unless the reader declared a pad, so no
/// half-built command ever reaches a card that would misread it.
#[derive(Debug)]
pub struct PinCompare<'a, T: CardTransport> {
    executor: &'a mut CardExecutor<EacSecureChannel<T>>,
    reference: u8,
    pinpad: bool,
}

impl<'a, T: CardTransport> PinCompare<'a, T> {
    /// Compare against the eID PIN
    pub fn new(executor: &'a mut CardExecutor<EacSecureChannel<T>>) -> Self {
        Self {
            executor,
            reference: PasswordType::Pin.reference(),
            pinpad: false,
        }
    }

    /// Address different reference data (P2 of the VERIFY)
    pub fn with_reference(mut self, reference: u8) -> Self {
        self.reference = reference;
        self
    }

    /// Declare whether the reader can collect digits on its own pad
    pub fn with_pinpad(mut self, available: bool) -> Self {
        self.pinpad = available;
        self
    }

    /// Run the comparison.
    ///
    /// Wrong digits surface as [`Error::WrongPasswordRetryCounter`] with the
    /// card's remaining tries, an exhausted counter as
    /// [`Error::PasswordBlocked`]. Supplied digits are dropped scrubbed
    /// whichever way the exchange ends.
    pub fn authenticate(&mut self, input: PinInput) -> Result<()> {
        let command = match input {
            PinInput::Digits(digits) => Verify::with_reference(self.reference, digits),
            PinInput::Pinpad if self.pinpad => Verify::template(self.reference),
            PinInput::Pinpad => {
                return Err(Error::InvalidProtocolState("reader provides no pinpad"));
            }
        };
        self.executor.execute(&command)?;
        debug!(reference = self.reference, "Password verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hex_literal::hex;

    use perso_apdu_core::SecureChannel;

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        responses: Vec<Bytes>,
        commands: Vec<Bytes>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Bytes>) -> Self {
            Self {
                responses,
                commands: Vec::new(),
            }
        }
    }

    impl CardTransport for ScriptedTransport {
        fn transmit_raw(&mut self, command: &[u8]) -> core::result::Result<Bytes, perso_apdu_core::Error> {
            self.commands.push(Bytes::copy_from_slice(command));
            if self.responses.is_empty() {
                return Err(perso_apdu_core::Error::TransmissionFailed);
            }
            Ok(self.responses.remove(0))
        }

        fn reset(&mut self) -> core::result::Result<(), perso_apdu_core::Error> {
            Ok(())
        }
    }

    fn executor(responses: Vec<&'static [u8]>) -> CardExecutor<EacSecureChannel<ScriptedTransport>> {
        let responses = responses.into_iter().map(Bytes::from_static).collect();
        CardExecutor::new(EacSecureChannel::new(ScriptedTransport::new(responses)))
    }

    #[test]
    fn test_supplied_digits_wire_format() {
        let mut executor = executor(vec![&hex!("9000")]);
        let mut digits = *b"123456";
        let input = PinInput::digits(&mut digits);
        // The caller's buffer is scrubbed the moment it is taken over.
        assert_eq!(digits, [0; 6]);

        PinCompare::new(&mut executor).authenticate(input).unwrap();

        let commands = &executor.transport().transport().commands;
        assert_eq!(commands[0].as_ref(), &hex!("00200003 06 313233343536"));
    }

    #[test]
    fn test_wrong_digits_report_remaining_tries() {
        let mut executor = executor(vec![&hex!("63C2"), &hex!("63C1"), &hex!("9000")]);
        let mut step = PinCompare::new(&mut executor);

        let mut first = *b"111111";
        assert!(matches!(
            step.authenticate(PinInput::digits(&mut first)),
            Err(Error::WrongPasswordRetryCounter(2))
        ));
        let mut second = *b"222222";
        assert!(matches!(
            step.authenticate(PinInput::digits(&mut second)),
            Err(Error::WrongPasswordRetryCounter(1))
        ));
        let mut third = *b"123456";
        step.authenticate(PinInput::digits(&mut third)).unwrap();
        assert_eq!(first, [0; 6]);
        assert_eq!(second, [0; 6]);

        drop(step);
        assert_eq!(executor.transport().transport().commands.len(), 3);
    }

    #[test]
    fn test_exhausted_counter_is_blocked() {
        let mut executor = executor(vec![&hex!("63C0")]);
        let mut digits = *b"000000";
        assert!(matches!(
            PinCompare::new(&mut executor).authenticate(PinInput::digits(&mut digits)),
            Err(Error::PasswordBlocked)
        ));
    }

    #[test]
    fn test_pinpad_sends_bare_template() {
        let mut executor = executor(vec![&hex!("9000")]);
        PinCompare::new(&mut executor)
            .with_pinpad(true)
            .authenticate(PinInput::Pinpad)
            .unwrap();

        let commands = &executor.transport().transport().commands;
        assert_eq!(commands[0].as_ref(), &hex!("00200003"));
    }

    #[test]
    fn test_pinpad_requires_a_declared_pad() {
        let mut executor = executor(vec![]);
        assert!(matches!(
            PinCompare::new(&mut executor).authenticate(PinInput::Pinpad),
            Err(Error::InvalidProtocolState(_))
        ));
        // Nothing reached the card.
        assert!(executor.transport().transport().commands.is_empty());
    }

    #[test]
    fn test_custom_reference() {
        let mut executor = executor(vec![&hex!("9000")]);
        let mut digits = *b"1234";
        PinCompare::new(&mut executor)
            .with_reference(0x81)
            .authenticate(PinInput::digits(&mut digits))
            .unwrap();

        let commands = &executor.transport().transport().commands;
        assert_eq!(commands[0].as_ref(), &hex!("00200081 04 31323334"));
    }
}
