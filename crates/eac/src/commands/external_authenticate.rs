//! EXTERNAL AUTHENTICATE (INS 0x82)

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response};

use super::CLA_PLAIN;
use crate::error::{Error, Result};

const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;

/// EXTERNAL AUTHENTICATE carrying the terminal authentication signature
/// over IDPICC, challenge and compressed ephemeral key
#[derive(Debug, Clone)]
pub struct ExternalAuthenticate {
    signature: Bytes,
}

impl ExternalAuthenticate {
    /// Wrap a plain (non-ASN.1) signature as produced by the terminal signer
    pub fn new(signature: impl Into<Bytes>) -> Self {
        Self {
            signature: signature.into(),
        }
    }
}

impl ApduCommand for ExternalAuthenticate {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new_with_data(
            CLA_PLAIN,
            INS_EXTERNAL_AUTHENTICATE,
            0x00,
            0x00,
            self.signature.clone(),
        )
    }

    fn parse_response(response: Response) -> Result<()> {
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::TerminalAuthenticationFailed(
                "signature rejected by the card",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let signature = vec![0x5A; 64];
        let bytes = ExternalAuthenticate::new(signature.clone())
            .to_command()
            .to_bytes();
        assert_eq!(&bytes[..5], [0x00, 0x82, 0x00, 0x00, 64]);
        assert_eq!(&bytes[5..], &signature[..]);
    }

    #[test]
    fn test_rejection_is_fatal() {
        let response = Response::status_only((0x63, 0x00));
        assert!(matches!(
            ExternalAuthenticate::parse_response(response),
            Err(Error::TerminalAuthenticationFailed(_))
        ));
    }
}
