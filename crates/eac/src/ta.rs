//! Terminal authentication, TR-03110 part 2 section 3.3 (version 2).
//!
//! The terminal proves its authorization to the chip: it imports a
//! certificate chain from the chip's trust point down to its own terminal
//! certificate, announces the certified key together with the compressed
//! ephemeral chip authentication key, and answers an eight byte card
//! challenge with a signature over session identifier, challenge and
//! ephemeral key. The certified private key normally sits at a remote eID
//! server; [`TerminalSigner`] is the seam that request travels through.

use bytes::Bytes;
use perso_apdu_core::{CardExecutor, CardTransport, Executor};
use tracing::debug;

use crate::commands::{
    ExternalAuthenticate, GetChallenge, ManageSecurityEnvironment, PsoVerifyCertificate,
};
use crate::cvc::CardVerifiableCertificate;
use crate::error::{Error, Result};
use crate::secure_messaging::EacSecureChannel;

/// Produces the terminal authentication signature.
///
/// Gets the concatenation [`signature_input`] builds and must return the
/// plain (non-ASN.1) ECDSA signature of the key the terminal certificate
/// certifies.
pub trait TerminalSigner {
    /// Sign `input` with the certified terminal key
    fn sign(&mut self, input: &[u8]) -> Result<Vec<u8>>;
}

/// The challenge the terminal signature covers:
/// `ID_PICC || r_PICC || Comp(ephemeral key)`
pub fn signature_input(id_picc: &[u8], challenge: &[u8], compressed_key: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(id_picc.len() + challenge.len() + compressed_key.len());
    input.extend_from_slice(id_picc);
    input.extend_from_slice(challenge);
    input.extend_from_slice(compressed_key);
    input
}

/// The terminal authentication exchange over a secure channel executor.
///
/// Runs inside the channel PACE established. [`run`](Self::run) drives the
/// whole exchange; the individual steps are public for flows where the
/// signature round trip to the eID server happens between two dispatch
/// calls.
#[derive(Debug)]
pub struct TerminalAuthentication<'a, T: CardTransport> {
    executor: &'a mut CardExecutor<EacSecureChannel<T>>,
}

impl<'a, T: CardTransport> TerminalAuthentication<'a, T> {
    /// Attach to the session executor
    pub fn new(executor: &'a mut CardExecutor<EacSecureChannel<T>>) -> Self {
        Self { executor }
    }

    /// Import `certificates`, issuer-first, stopping at the first rejection.
    ///
    /// Every certificate is announced with an MSE:Set DST naming the key
    /// that verifies it, then submitted with PSO:Verify Certificate.
    pub fn present_certificates(
        &mut self,
        certificates: &[CardVerifiableCertificate],
    ) -> Result<()> {
        for certificate in certificates {
            debug!(car = %certificate.car(), chr = %certificate.chr(),
                "Presenting certificate");
            self.executor
                .execute(&ManageSecurityEnvironment::set_dst(certificate.car()))?;
            self.executor.execute(&PsoVerifyCertificate::new(certificate))?;
        }
        Ok(())
    }

    /// MSE:Set AT binding the run to the terminal key and to the ephemeral
    /// chip authentication key; `auxiliary_data` is the encoded 0x67
    /// template for age or community checks, passed through verbatim
    pub fn announce(
        &mut self,
        terminal: &CardVerifiableCertificate,
        compressed_ephemeral_key: &[u8],
        auxiliary_data: Option<&[u8]>,
    ) -> Result<()> {
        self.executor
            .execute(&ManageSecurityEnvironment::terminal_authentication(
                terminal.public_key().protocol(),
                terminal.chr(),
                compressed_ephemeral_key,
                auxiliary_data,
            ))
    }

    /// The eight card bytes the signature must cover
    pub fn request_challenge(&mut self) -> Result<Bytes> {
        self.executor.execute(&GetChallenge)
    }

    /// Submit the terminal signature
    pub fn authenticate(&mut self, signature: impl Into<Bytes>) -> Result<()> {
        self.executor.execute(&ExternalAuthenticate::new(signature))?;
        debug!("Terminal authenticated");
        Ok(())
    }

    /// The complete exchange with a locally reachable signer.
    ///
    /// `certificates` is the presentation suffix for the chip's trust point,
    /// terminal certificate last; `id_picc` the identifier from the PACE
    /// run. Returns the challenge the signature covered.
    pub fn run<S: TerminalSigner>(
        &mut self,
        certificates: &[CardVerifiableCertificate],
        compressed_ephemeral_key: &[u8],
        auxiliary_data: Option<&[u8]>,
        id_picc: &[u8],
        signer: &mut S,
    ) -> Result<Bytes> {
        let Some((terminal, _)) = certificates.split_last() else {
            return Err(Error::ChainIncomplete);
        };
        self.present_certificates(certificates)?;
        self.announce(terminal, compressed_ephemeral_key, auxiliary_data)?;
        let challenge = self.request_challenge()?;
        let signature =
            signer.sign(&signature_input(id_picc, &challenge, compressed_ephemeral_key))?;
        self.authenticate(signature)?;
        Ok(challenge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use perso_apdu_core::SecureChannel;

    use crate::cvc::{CvcDate, build_certificate};
    use crate::oid::Oid;

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

    /// Returns a canned signature and records what it was asked to sign
    #[derive(Default)]
    struct FixedSigner {
        inputs: Vec<Vec<u8>>,
    }

    impl TerminalSigner for FixedSigner {
        fn sign(&mut self, input: &[u8]) -> Result<Vec<u8>> {
            self.inputs.push(input.to_vec());
            Ok(vec![0x5A; 64])
        }
    }

    const CVCA: &str = "DECVCA00001";
    const DV: &str = "DEDVCA00001";
    const TERMINAL: &str = "DETERM00001";
    const CHALLENGE: [u8; 8] = hex!("FEDCBA9876543210");

    fn dv_certificate() -> CardVerifiableCertificate {
        let encoded = build_certificate(
            CVCA,
            DV,
            &[0x80, 0x00, 0x00, 0x00, 0x00],
            CvcDate::new(2026, 7, 1),
            CvcDate::new(2026, 10, 1),
        );
        CardVerifiableCertificate::parse(encoded).unwrap()
    }

    fn terminal_certificate() -> CardVerifiableCertificate {
        let encoded = build_certificate(
            DV,
            TERMINAL,
            &[0x00, 0x00, 0x00, 0x00, 0x01],
            CvcDate::new(2026, 8, 1),
            CvcDate::new(2026, 9, 1),
        );
        CardVerifiableCertificate::parse(encoded).unwrap()
    }

    fn executor(responses: Vec<Bytes>) -> CardExecutor<EacSecureChannel<ScriptedTransport>> {
        CardExecutor::new(EacSecureChannel::new(ScriptedTransport::new(responses)))
    }

    fn ok() -> Bytes {
        Bytes::from_static(&hex!("9000"))
    }

    #[test]
    fn test_run_against_scripted_card() {
        let chain = vec![dv_certificate(), terminal_certificate()];
        let compressed = [0x11; 32];
        let id_picc = [0x22; 32];

        let mut responses = vec![ok(); 5];
        let mut challenge_response = CHALLENGE.to_vec();
        challenge_response.extend_from_slice(&hex!("9000"));
        responses.push(Bytes::from(challenge_response));
        responses.push(ok());

        let mut executor = executor(responses);
        let mut signer = FixedSigner::default();
        let mut ta = TerminalAuthentication::new(&mut executor);
        let challenge = ta
            .run(&chain, &compressed, None, &id_picc, &mut signer)
            .unwrap();
        assert_eq!(challenge.as_ref(), CHALLENGE);

        // The signature covered IDPICC, challenge and compressed key.
        let mut expected_input = id_picc.to_vec();
        expected_input.extend_from_slice(&CHALLENGE);
        expected_input.extend_from_slice(&compressed);
        assert_eq!(signer.inputs, vec![expected_input]);

        let commands = &executor.transport().transport().commands;
        assert_eq!(commands.len(), 7);

        // Each certificate: MSE:Set DST naming the verifying key, then PSO.
        let mut set_dst_dv = hex!("0022 81B6 0D 830B").to_vec();
        set_dst_dv.extend_from_slice(CVCA.as_bytes());
        assert_eq!(commands[0].as_ref(), set_dst_dv);
        assert_eq!(&commands[1][..4], hex!("002A00BE"));
        assert_eq!(&commands[1][5..], dv_certificate().content());

        let mut set_dst_terminal = hex!("0022 81B6 0D 830B").to_vec();
        set_dst_terminal.extend_from_slice(DV.as_bytes());
        assert_eq!(commands[2].as_ref(), set_dst_terminal);
        assert_eq!(&commands[3][..4], hex!("002A00BE"));
        assert_eq!(&commands[3][5..], terminal_certificate().content());

        // MSE:Set AT with protocol, terminal holder reference and the
        // compressed ephemeral key.
        let mut set_at = hex!("0022 81A4 3B 800A").to_vec();
        set_at.extend_from_slice(Oid::TA_ECDSA_SHA_256.encoded());
        set_at.extend_from_slice(&hex!("830B"));
        set_at.extend_from_slice(TERMINAL.as_bytes());
        set_at.extend_from_slice(&hex!("9120"));
        set_at.extend_from_slice(&compressed);
        assert_eq!(commands[4].as_ref(), set_at);

        assert_eq!(commands[5].as_ref(), hex!("0084000008"));

        let mut external = hex!("00820000 40").to_vec();
        external.extend_from_slice(&[0x5A; 64]);
        assert_eq!(commands[6].as_ref(), external);
    }

    #[test]
    fn test_announce_appends_auxiliary_data() {
        let terminal = terminal_certificate();
        let compressed = [0x11; 32];
        // Encoded 0x67 template: age verification against 2008-08-25.
        let aux = hex!("6717 7315 060904007F000703010401 5308 3230303830383235");

        let mut executor = executor(vec![ok()]);
        let mut ta = TerminalAuthentication::new(&mut executor);
        ta.announce(&terminal, &compressed, Some(&aux)).unwrap();

        let command = &executor.transport().transport().commands[0];
        assert_eq!(&command[..2], hex!("0022"));
        assert_eq!(&command[2..4], hex!("81A4"));
        assert_eq!(command[4] as usize, command.len() - 5);
        assert!(command.ends_with(&aux));
    }

    #[test]
    fn test_presentation_stops_at_first_rejection() {
        let chain = vec![dv_certificate(), terminal_certificate()];
        let mut executor = executor(vec![ok(), Bytes::from_static(&hex!("6985"))]);
        let mut ta = TerminalAuthentication::new(&mut executor);

        assert!(matches!(
            ta.present_certificates(&chain),
            Err(Error::TerminalAuthenticationFailed(_))
        ));
        // The terminal certificate was never submitted.
        assert_eq!(executor.transport().transport().commands.len(), 2);
    }

    #[test]
    fn test_run_rejects_empty_chain() {
        let mut executor = executor(vec![]);
        let mut signer = FixedSigner::default();
        let mut ta = TerminalAuthentication::new(&mut executor);

        assert!(matches!(
            ta.run(&[], &[0x11; 32], None, &[0x22; 32], &mut signer),
            Err(Error::ChainIncomplete)
        ));
        assert!(signer.inputs.is_empty());
        assert!(executor.transport().transport().commands.is_empty());
    }

    #[test]
    fn test_signer_failure_aborts_before_submission() {
        struct RefusingSigner;
        impl TerminalSigner for RefusingSigner {
            fn sign(&mut self, _input: &[u8]) -> Result<Vec<u8>> {
                Err(Error::TerminalAuthenticationFailed("signer unreachable"))
            }
        }

        let chain = vec![terminal_certificate()];
        let mut responses = vec![ok(); 3];
        let mut challenge_response = CHALLENGE.to_vec();
        challenge_response.extend_from_slice(&hex!("9000"));
        responses.push(Bytes::from(challenge_response));

        let mut executor = executor(responses);
        let mut ta = TerminalAuthentication::new(&mut executor);
        assert!(ta
            .run(&chain, &[0x11; 32], None, &[0x22; 32], &mut RefusingSigner)
            .is_err());
        // MSE:Set DST, PSO, MSE:Set AT and the challenge, but no signature.
        assert_eq!(executor.transport().transport().commands.len(), 4);
    }
}
