//! Password authenticated connection establishment, TR-03110 part 2
//! section 3.2, generic mapping over elliptic curves.
//!
//! The exchange is four General Authenticate round trips after an MSE:Set AT
//! announcement: the card hands out a nonce encrypted under the password key,
//! both sides derive a session generator from the nonce and a mapping key
//! agreement, agree on ephemeral keys over the mapped generator, and confirm
//! the derived session keys with CMAC tokens over each other's ephemeral
//! key. A finished run installs the keys into the [`EacSecureChannel`] the
//! executor drives, so every later command of the session is enveloped.

use core::mem;

use bytes::Bytes;
use crypto_bigint::BoxedUint;
use perso_apdu_core::{CardExecutor, CardTransport, Executor};
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::commands::{GeneralAuthenticate, PaceMseSetAt, PasswordStatus, PasswordType};
use crate::crypto::elliptic::{AffinePoint, Curve, standardized_curve};
use crate::crypto::sym::{BLOCK_LEN, SymmetricSuite};
use crate::cvc::{Chat, PublicKeyReference};
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::secure_messaging::{EacSecureChannel, SecureMessaging, SessionKeys};
use crate::securityinfo::{DomainParameters, SecurityInfos};
use crate::tlv::{Tag, TlvWriter};

/// A PACE password and its type.
///
/// Construction copies the secret into an internal [`Zeroizing`] buffer and
/// scrubs the caller's bytes immediately, so the plaintext never outlives the
/// run regardless of how it ends. MRZ passwords are reduced to their SHA-1
/// digest up front; PIN, CAN and PUK enter the key derivation as their ASCII
/// digits.
pub struct PacePassword {
    kind: PasswordType,
    secret: Zeroizing<Vec<u8>>,
}

impl PacePassword {
    /// The eID PIN, taking and scrubbing the caller's digit buffer
    pub fn pin(digits: &mut [u8]) -> Self {
        Self::plain(PasswordType::Pin, digits)
    }

    /// The card access number printed on the card
    pub fn can(digits: &mut [u8]) -> Self {
        Self::plain(PasswordType::Can, digits)
    }

    /// The unblocking key from the PIN letter
    pub fn puk(digits: &mut [u8]) -> Self {
        Self::plain(PasswordType::Puk, digits)
    }

    /// The machine readable zone of a travel document
    pub fn mrz(data: &mut [u8]) -> Self {
        let digest = Sha1::digest(&data);
        data.zeroize();
        Self {
            kind: PasswordType::Mrz,
            secret: Zeroizing::new(digest.to_vec()),
        }
    }

    fn plain(kind: PasswordType, bytes: &mut [u8]) -> Self {
        let secret = Zeroizing::new(bytes.to_vec());
        bytes.zeroize();
        Self { kind, secret }
    }

    /// The password type announced to the card
    pub const fn kind(&self) -> PasswordType {
        self.kind
    }

    /// KDF(password, 3) for the negotiated suite
    pub(crate) fn derive_key(&self, suite: SymmetricSuite) -> Zeroizing<Vec<u8>> {
        suite.derive_password_key(&self.secret)
    }
}

impl core::fmt::Debug for PacePassword {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacePassword")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Where a PACE run stands, with the data each stage has produced
pub enum PaceState {
    /// Nothing exchanged yet
    Init,
    /// The card's nonce has been recovered under the password key
    NonceRequested {
        /// The decrypted nonce `s`
        nonce: Zeroizing<Vec<u8>>,
    },
    /// The session generator `s·G + H` has been derived
    MappingDone {
        /// The curve with the mapped generator
        mapped: Curve,
    },
    /// Ephemeral keys exchanged, session keys derived but unconfirmed
    KeyAgreementDone {
        /// The curve with the mapped generator
        mapped: Curve,
        /// Terminal ephemeral public key
        own_public: AffinePoint,
        /// Card ephemeral public key
        peer_public: AffinePoint,
        /// Secure messaging keys pending token confirmation
        keys: SessionKeys,
    },
    /// Both authentication tokens verified
    MutualAuthDone {
        /// Confirmed secure messaging keys
        keys: SessionKeys,
        /// Report for the caller
        output: PaceOutput,
    },
    /// Keys installed into the channel; the run is complete
    Established,
    /// A step failed; the machine cannot be resumed
    Failed,
}

impl core::fmt::Debug for PaceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Init => "Init",
            Self::NonceRequested { .. } => "NonceRequested",
            Self::MappingDone { .. } => "MappingDone",
            Self::KeyAgreementDone { .. } => "KeyAgreementDone",
            Self::MutualAuthDone { .. } => "MutualAuthDone",
            Self::Established => "Established",
            Self::Failed => "Failed",
        })
    }
}

/// What a finished PACE run reports upstream
#[derive(Debug, Clone)]
pub struct PaceOutput {
    /// The negotiated cipher suite identifier
    pub protocol: Oid,
    /// The negotiated AES flavor
    pub suite: SymmetricSuite,
    /// Remaining password attempts as graded by the announcement
    pub retry_counter: u8,
    /// Certification authority reference the card trusts, when volunteered
    pub current_car: Option<PublicKeyReference>,
    /// Previous trust point during a root rollover, when volunteered
    pub previous_car: Option<PublicKeyReference>,
    /// Compressed card ephemeral key, binding terminal authentication to
    /// this run
    pub id_picc: Bytes,
}

/// The PACE machine over a secure channel executor.
///
/// Construction negotiates a cipher suite from the card's EF.CardAccess;
/// [`establish`](Self::establish) then drives the exchange to completion and
/// installs the session keys into the executor's channel. The machine is
/// single-use: a failed run parks it in [`PaceState::Failed`].
#[derive(Debug)]
pub struct Pace<'a, T: CardTransport> {
    executor: &'a mut CardExecutor<EacSecureChannel<T>>,
    protocol: Oid,
    suite: SymmetricSuite,
    parameter_id: Option<i32>,
    curve: &'static Curve,
    state: PaceState,
    retry_counter: u8,
}

impl<'a, T: CardTransport> Pace<'a, T> {
    /// Pick the first workable cipher suite from the card's announcements
    pub fn new(
        executor: &'a mut CardExecutor<EacSecureChannel<T>>,
        infos: &SecurityInfos,
    ) -> Result<Self> {
        for info in infos.pace_infos() {
            let Ok(suite) = SymmetricSuite::for_pace_protocol(&info.protocol) else {
                continue;
            };
            // The parameter reference lives either in the PACEInfo itself or
            // in a domain parameter info of the same mapping family.
            let index = info.parameter_id.or_else(|| {
                infos.pace_domain_parameter_infos().find_map(|dp| {
                    match (info.protocol.starts_with(&dp.protocol), &dp.domain_parameter) {
                        (true, DomainParameters::Standardized(index)) => Some(*index),
                        _ => None,
                    }
                })
            });
            let Some(curve) = index.and_then(|index| standardized_curve(index).ok()) else {
                continue;
            };

            debug!(protocol = %info.protocol, ?suite, "Negotiated PACE suite");
            return Ok(Self {
                executor,
                protocol: info.protocol.clone(),
                suite,
                parameter_id: info.parameter_id,
                curve,
                state: PaceState::Init,
                retry_counter: 3,
            });
        }
        Err(Error::UnsupportedProtocol(
            "no mutually supported PACE suite".into(),
        ))
    }

    /// The negotiated cipher suite identifier
    pub const fn protocol(&self) -> &Oid {
        &self.protocol
    }

    /// The negotiated AES flavor
    pub const fn suite(&self) -> SymmetricSuite {
        self.suite
    }

    /// Where the run stands
    pub const fn state(&self) -> &PaceState {
        &self.state
    }

    /// Ask the card for the state of `kind` without running the exchange.
    ///
    /// Sends the same MSE:Set AT the run opens with; the card grades the
    /// password in its status word and no General Authenticate follows.
    pub fn password_status(&mut self, kind: PasswordType) -> Result<PasswordStatus> {
        self.executor
            .execute(&PaceMseSetAt::new(&self.protocol, kind, self.parameter_id, None))
    }

    /// Run the exchange and install the session keys into the channel.
    ///
    /// `rng` provides the mapping and ephemeral scalars. On any failure the
    /// machine transitions to [`PaceState::Failed`] and the channel stays
    /// unestablished; wrong-password outcomes surface as
    /// [`Error::WrongPasswordRetryCounter`] and friends so callers can
    /// prompt again or switch to the CAN.
    pub fn establish<R: RngCore + ?Sized>(
        &mut self,
        password: &PacePassword,
        chat: Option<&Chat>,
        rng: &mut R,
    ) -> Result<PaceOutput> {
        if !matches!(self.state, PaceState::Init) {
            return Err(Error::InvalidProtocolState("PACE machine already used"));
        }
        self.run(password, chat, rng).inspect_err(|error| {
            warn!(%error, "PACE failed");
            self.state = PaceState::Failed;
        })
    }

    fn run<R: RngCore + ?Sized>(
        &mut self,
        password: &PacePassword,
        chat: Option<&Chat>,
        rng: &mut R,
    ) -> Result<PaceOutput> {
        self.announce(password.kind(), chat)?;
        self.request_nonce(password)?;
        self.map_nonce(rng)?;
        self.agree_keys(rng)?;
        self.mutual_authentication()?;
        self.install()
    }

    /// MSE:Set AT. The status word grades the password; warnings keep the
    /// run going because the counter reflects earlier attempts, not this one.
    fn announce(&mut self, kind: PasswordType, chat: Option<&Chat>) -> Result<()> {
        let command = PaceMseSetAt::new(&self.protocol, kind, self.parameter_id, chat);
        let status = self.executor.execute(&command)?;
        self.retry_counter = status.tries_left();
        match status {
            PasswordStatus::Ready { tries } => {
                debug!(%kind, tries, "PACE announced");
                Ok(())
            }
            PasswordStatus::Suspended => {
                warn!(%kind, "password suspended, a CAN run must precede the next attempt");
                Ok(())
            }
            PasswordStatus::Blocked if kind == PasswordType::Puk => {
                warn!("password blocked, continuing with the unblocking key");
                Ok(())
            }
            PasswordStatus::Blocked => Err(Error::PasswordBlocked),
            PasswordStatus::Deactivated => Err(Error::CardDeactivated),
        }
    }

    /// First round: the card's encrypted nonce, recovered with KDF(π, 3)
    fn request_nonce(&mut self, password: &PacePassword) -> Result<()> {
        let data = self.executor.execute(&GeneralAuthenticate::request_nonce())?;
        let encrypted = data.require(0x80, "encrypted nonce missing")?;
        let key = password.derive_key(self.suite);
        let nonce = self.suite.decrypt_cbc(&key, &[0; BLOCK_LEN], encrypted)?;
        trace!("nonce recovered");
        self.state = PaceState::NonceRequested { nonce };
        Ok(())
    }

    /// Second round: mapping key agreement, then `G' = s·G + H`
    fn map_nonce<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let PaceState::NonceRequested { nonce } =
            mem::replace(&mut self.state, PaceState::Failed)
        else {
            return Err(Error::InvalidProtocolState("mapping before nonce request"));
        };

        let (private, public) = self.curve.generate_keypair(rng)?;
        let data = self
            .executor
            .execute(&GeneralAuthenticate::map_nonce(&self.curve.encode_point(&public)))?;
        let peer = self
            .curve
            .decode_point(data.require(0x82, "mapping key missing")?)?;
        if peer == public {
            return Err(Error::DiffieHellmanKeysEqual);
        }

        let shared = self.curve.multiply(&private, &peer)?;
        let s = BoxedUint::from_be_slice(&nonce, 8 * nonce.len() as u32)
            .map_err(|_| Error::Crypto("nonce does not fit a scalar"))?;
        let mapped = self.curve.map_generator(&s, &shared)?;
        trace!("generator mapped");
        self.state = PaceState::MappingDone { mapped };
        Ok(())
    }

    /// Third round: ephemeral key agreement on the mapped generator,
    /// deriving the candidate session keys
    fn agree_keys<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let PaceState::MappingDone { mapped } = mem::replace(&mut self.state, PaceState::Failed)
        else {
            return Err(Error::InvalidProtocolState("key agreement before mapping"));
        };

        let (private, own_public) = mapped.generate_keypair(rng)?;
        let data = self
            .executor
            .execute(&GeneralAuthenticate::key_agreement(&mapped.encode_point(&own_public)))?;
        let peer_public = mapped.decode_point(data.require(0x84, "ephemeral key missing")?)?;
        if peer_public == own_public {
            return Err(Error::DiffieHellmanKeysEqual);
        }

        let shared = mapped.multiply(&private, &peer_public)?;
        let secret = mapped.x_bytes(&shared);
        let keys = SessionKeys::derive(self.suite, &secret, None);
        self.state = PaceState::KeyAgreementDone {
            mapped,
            own_public,
            peer_public,
            keys,
        };
        Ok(())
    }

    /// Final round: exchange CMAC tokens over the peer's ephemeral key
    fn mutual_authentication(&mut self) -> Result<()> {
        let PaceState::KeyAgreementDone {
            mapped,
            own_public,
            peer_public,
            keys,
        } = mem::replace(&mut self.state, PaceState::Failed)
        else {
            return Err(Error::InvalidProtocolState("token exchange before key agreement"));
        };

        let own_token =
            keys.mac(&authentication_token_input(&self.protocol, &mapped, &peer_public))?;
        let data = self
            .executor
            .execute(&GeneralAuthenticate::mutual_authentication(&own_token))?;

        let received = data.require(0x86, "authentication token missing")?;
        let expected =
            keys.mac(&authentication_token_input(&self.protocol, &mapped, &own_public))?;
        if received.len() != expected.len() || !bool::from(expected.ct_eq(received)) {
            return Err(Error::AuthenticationTokenMismatch);
        }

        // eID cards volunteer their trust point alongside the token.
        let current_car = data.field(0x87).map(PublicKeyReference::parse).transpose()?;
        let previous_car = data.field(0x88).map(PublicKeyReference::parse).transpose()?;
        let output = PaceOutput {
            protocol: self.protocol.clone(),
            suite: self.suite,
            retry_counter: self.retry_counter,
            current_car,
            previous_car,
            id_picc: Bytes::from(mapped.x_bytes(&peer_public).to_vec()),
        };
        self.state = PaceState::MutualAuthDone { keys, output };
        Ok(())
    }

    fn install(&mut self) -> Result<PaceOutput> {
        let PaceState::MutualAuthDone { keys, output } =
            mem::replace(&mut self.state, PaceState::Failed)
        else {
            return Err(Error::InvalidProtocolState("no confirmed session keys"));
        };
        self.executor.transport_mut().install(keys);
        self.state = PaceState::Established;
        debug!(suite = ?output.suite, retry_counter = output.retry_counter, "PACE established");
        Ok(output)
    }
}

/// The 0x7F49 public key object an authentication token is computed over:
/// the protocol identifier and one party's ephemeral key, uncompressed.
/// Chip authentication confirms its session keys over the same structure.
pub(crate) fn authentication_token_input(
    protocol: &Oid,
    curve: &Curve,
    public: &AffinePoint,
) -> Bytes {
    let mut writer = TlvWriter::new();
    writer.constructed(Tag::PUBLIC_KEY, |w| {
        w.primitive(0x06, protocol.encoded());
        w.primitive(0x86, &curve.encode_point(public));
    });
    writer.into_bytes()
}
