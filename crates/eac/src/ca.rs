//! Chip authentication, TR-03110 part 2 section 3.4, ECDH flavor.
//!
//! The chip proves it holds the private half of the static key published in
//! the signed EF.CardSecurity. The terminal announces an ephemeral key
//! during terminal authentication, agrees a fresh secret with the chip's
//! static key, and both sides derive new session keys mixed with a chip
//! nonce. The chip confirms the keys with a CMAC token over the terminal's
//! ephemeral key; a verified token swaps the new keys into the running
//! [`EacSecureChannel`], a failed one discards the channel altogether.

use bytes::Bytes;
use crypto_bigint::BoxedUint;
use perso_apdu_core::{CardExecutor, CardTransport, Executor, SecureChannel};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::commands::{GeneralAuthenticate, ManageSecurityEnvironment};
use crate::crypto::elliptic::{AffinePoint, Curve, standardized_curve};
use crate::crypto::sym::SymmetricSuite;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::pace::authentication_token_input;
use crate::secure_messaging::{EacSecureChannel, SecureMessaging, SessionKeys};
use crate::securityinfo::{DomainParameters, SecurityInfos};

/// The terminal's ephemeral chip authentication key pair.
///
/// Generated before terminal authentication starts: the compressed public
/// half goes into the MSE:Set AT announcement and is covered by the
/// terminal's signature, the private half feeds the key agreement once
/// [`ChipAuthentication::authenticate`] runs.
pub struct EphemeralKeyPair {
    curve: &'static Curve,
    private: Zeroizing<BoxedUint>,
    public: AffinePoint,
}

impl EphemeralKeyPair {
    /// Draw a key pair on the curve the card's chip authentication domain
    /// parameters name
    pub fn generate<R: RngCore + ?Sized>(infos: &SecurityInfos, rng: &mut R) -> Result<Self> {
        let curve = infos
            .chip_authentication_domain_parameter_infos()
            .find_map(|dp| match &dp.domain_parameter {
                DomainParameters::Standardized(index) => standardized_curve(*index).ok(),
                DomainParameters::Explicit { .. } => None,
            })
            .ok_or_else(|| {
                Error::UnsupportedProtocol(
                    "no usable chip authentication domain parameters".into(),
                )
            })?;
        let (private, public) = curve.generate_keypair(rng)?;
        Ok(Self {
            curve,
            private,
            public,
        })
    }

    /// The compressed public key, the x-coordinate, as bound into the
    /// terminal authentication signature
    pub fn compressed(&self) -> Vec<u8> {
        self.curve.x_bytes(&self.public).to_vec()
    }

    /// The uncompressed public key sent to the chip
    pub fn public_encoded(&self) -> Vec<u8> {
        self.curve.encode_point(&self.public)
    }

    /// ECDH against the chip's static key
    fn agree(&self, peer: &AffinePoint) -> Result<Zeroizing<Vec<u8>>> {
        let shared = self.curve.multiply(&self.private, peer)?;
        Ok(self.curve.x_bytes(&shared))
    }
}

impl core::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// What a finished chip authentication reports upstream
#[derive(Debug, Clone)]
pub struct ChipAuthenticationOutput {
    /// The negotiated cipher suite identifier
    pub protocol: Oid,
    /// The chip's nonce mixed into the key derivation
    pub nonce: Bytes,
    /// The chip's authentication token, verified before being handed out
    pub token: Bytes,
}

/// The chip authentication run over a secure channel executor.
///
/// Construction negotiates a cipher suite from the card's announcements;
/// [`authenticate`](Self::authenticate) performs the single round trip and
/// re-keys the channel. Runs after terminal authentication, inside the
/// channel PACE established.
#[derive(Debug)]
pub struct ChipAuthentication<'a, T: CardTransport> {
    executor: &'a mut CardExecutor<EacSecureChannel<T>>,
    protocol: Oid,
    suite: SymmetricSuite,
    key_id: Option<i32>,
}

impl<'a, T: CardTransport> ChipAuthentication<'a, T> {
    /// Pick the first workable version 2 suite from the card's announcements
    pub fn new(
        executor: &'a mut CardExecutor<EacSecureChannel<T>>,
        infos: &SecurityInfos,
    ) -> Result<Self> {
        for info in infos.chip_authentication_infos() {
            if info.version != 2 {
                debug!(protocol = %info.protocol, version = info.version,
                    "skipping chip authentication version");
                continue;
            }
            let Ok(suite) = SymmetricSuite::for_chip_authentication_protocol(&info.protocol)
            else {
                continue;
            };

            debug!(protocol = %info.protocol, ?suite, key_id = ?info.key_id,
                "Negotiated chip authentication suite");
            return Ok(Self {
                executor,
                protocol: info.protocol.clone(),
                suite,
                key_id: info.key_id,
            });
        }
        Err(Error::UnsupportedProtocol(
            "no mutually supported chip authentication suite".into(),
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

    /// The chip key the run is pinned to, when the card holds several
    pub const fn key_id(&self) -> Option<i32> {
        self.key_id
    }

    /// Run the round trip and swap the channel onto the fresh keys.
    ///
    /// `ephemeral_key` must be the pair whose compressed form went into the
    /// terminal authentication announcement; `card_security` the verified
    /// content of EF.CardSecurity holding the chip's static key. A wrong
    /// token closes the channel and surfaces as
    /// [`Error::ChipAuthenticationFailed`].
    pub fn authenticate(
        &mut self,
        ephemeral_key: &EphemeralKeyPair,
        card_security: &SecurityInfos,
    ) -> Result<ChipAuthenticationOutput> {
        let chip_key = card_security
            .chip_authentication_public_key_infos()
            .find(|info| self.key_id.is_none() || info.key_id == self.key_id)
            .ok_or(Error::ChipAuthenticationFailed(
                "no matching chip key in EF.CardSecurity",
            ))?;
        let chip_point = ephemeral_key.curve.decode_point(&chip_key.public_key)?;

        self.executor
            .execute(&ManageSecurityEnvironment::chip_authentication(
                &self.protocol,
                self.key_id,
            ))?;
        let data = self
            .executor
            .execute(&GeneralAuthenticate::chip_authentication(
                &ephemeral_key.public_encoded(),
            ))?;
        let nonce = Bytes::copy_from_slice(data.require(0x81, "chip nonce missing")?);
        let token = data.require(0x82, "chip authentication token missing")?;

        let secret = ephemeral_key.agree(&chip_point)?;
        let keys = SessionKeys::derive(self.suite, &secret, Some(nonce.as_ref()));
        let expected = keys.mac(&authentication_token_input(
            &self.protocol,
            ephemeral_key.curve,
            &ephemeral_key.public,
        ))?;
        if token.len() != expected.len() || !bool::from(expected.ct_eq(token)) {
            // A failed proof also invalidates the password-derived channel.
            warn!("chip authentication token mismatch");
            let _ = self.executor.transport_mut().close();
            return Err(Error::ChipAuthenticationFailed("wrong authentication token"));
        }

        let output = ChipAuthenticationOutput {
            protocol: self.protocol.clone(),
            nonce,
            token: Bytes::copy_from_slice(token),
        };
        self.executor.transport_mut().replace_keys(keys);
        debug!(suite = ?self.suite, "Chip authenticated, channel re-keyed");
        Ok(output)
    }
}
