//! VERIFY (INS 0x20)

use perso_apdu_core::{ApduCommand, Command, Response};
use zeroize::Zeroizing;

use super::{CLA_PLAIN, unexpected_status};
use crate::error::{Error, Result};

const INS_VERIFY: u8 = 0x20;

/// VERIFY comparing card-held reference data against a supplied password.
///
/// The encoded password stays in a [`Zeroizing`] buffer until the command is
/// serialized; the protocol step owning the original digits scrubs them on
/// every exit path. The [`template`](Self::template) form carries no data
/// field at all, for readers that collect the digits on their own pad and
/// complete the command in firmware.
#[derive(Debug)]
pub struct Verify {
    reference: u8,
    password: Option<Zeroizing<Vec<u8>>>,
}

impl Verify {
    /// Verify against the reference data addressed by `reference`
    /// (P2 of the command, e.g. 0x03 for the eID PIN or 0x81 for a
    /// DF-local password 1)
    pub fn with_reference(reference: u8, password: Zeroizing<Vec<u8>>) -> Self {
        Self {
            reference,
            password: Some(password),
        }
    }

    /// Bare template without reference data, completed by a pinpad reader
    pub const fn template(reference: u8) -> Self {
        Self {
            reference,
            password: None,
        }
    }
}

impl ApduCommand for Verify {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        let command = Command::new(CLA_PLAIN, INS_VERIFY, 0x00, self.reference);
        match &self.password {
            Some(password) => command.with_data(password.to_vec()),
            None => command,
        }
    }

    fn parse_response(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_authentication_method_blocked() {
            return Err(Error::PasswordBlocked);
        }
        match status.retry_counter() {
            Some(0) => Err(Error::PasswordBlocked),
            Some(tries) => Err(Error::WrongPasswordRetryCounter(tries)),
            None => Err(unexpected_status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_wire_format() {
        let password = Zeroizing::new(b"123456".to_vec());
        let bytes = Verify::with_reference(0x03, password).to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00200003 06 313233343536"));
    }

    #[test]
    fn test_template_has_no_data_field() {
        let bytes = Verify::template(0x03).to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00200003"));
    }

    #[test]
    fn test_retry_counter_mapping() {
        let parse = |sw1, sw2| Verify::parse_response(Response::status_only((sw1, sw2)));
        assert!(parse(0x90, 0x00).is_ok());
        assert!(matches!(
            parse(0x63, 0xC2),
            Err(Error::WrongPasswordRetryCounter(2))
        ));
        assert!(matches!(
            parse(0x63, 0xC1),
            Err(Error::WrongPasswordRetryCounter(1))
        ));
        assert!(matches!(parse(0x63, 0xC0), Err(Error::PasswordBlocked)));
        assert!(matches!(parse(0x69, 0x83), Err(Error::PasswordBlocked)));
        assert!(matches!(parse(0x69, 0x82), Err(Error::DispatchFailure(_))));
    }
}
