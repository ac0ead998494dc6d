//! PERFORM SECURITY OPERATION: Verify Certificate (INS 0x2A)

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response};

use super::CLA_PLAIN;
use crate::cvc::CardVerifiableCertificate;
use crate::error::{Error, Result};

const INS_PSO: u8 = 0x2A;

/// PSO:Verify Certificate importing one link of the terminal's chain.
///
/// The data field is the certificate content (body and signature, without
/// the outer 0x7F21 header); the verification key must have been named by a
/// preceding MSE:Set DST.
#[derive(Debug, Clone)]
pub struct PsoVerifyCertificate {
    content: Bytes,
}

impl PsoVerifyCertificate {
    /// Submit `certificate` for on-card verification
    pub fn new(certificate: &CardVerifiableCertificate) -> Self {
        Self {
            content: Bytes::copy_from_slice(certificate.content()),
        }
    }
}

impl ApduCommand for PsoVerifyCertificate {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new_with_data(CLA_PLAIN, INS_PSO, 0x00, 0xBE, self.content.clone())
    }

    fn parse_response(response: Response) -> Result<()> {
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::TerminalAuthenticationFailed(
                "certificate rejected by the card",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvc::{CvcDate, build_certificate};

    fn certificate() -> CardVerifiableCertificate {
        let encoded = build_certificate(
            "DECVCAeID00103",
            "DEDVeID00105",
            &[0x80, 0, 0, 0, 0],
            CvcDate::new(2026, 1, 1),
            CvcDate::new(2026, 4, 1),
        );
        CardVerifiableCertificate::parse(encoded).unwrap()
    }

    #[test]
    fn test_wire_format() {
        let certificate = certificate();
        let bytes = PsoVerifyCertificate::new(&certificate).to_command().to_bytes();
        assert_eq!(&bytes[..4], [0x00, 0x2A, 0x00, 0xBE]);
        assert_eq!(bytes[4] as usize, certificate.content().len());
        assert_eq!(&bytes[5..], certificate.content());
    }

    #[test]
    fn test_rejection_is_fatal() {
        let response = Response::status_only((0x69, 0x85));
        assert!(matches!(
            PsoVerifyCertificate::parse_response(response),
            Err(Error::TerminalAuthenticationFailed(_))
        ));
    }
}
