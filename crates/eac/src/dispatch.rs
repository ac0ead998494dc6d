//! Typed dispatch of DID protocol requests onto a card session.
//!
//! A [`ProtocolRegistry`] maps TR-03112 protocol URIs to factories; the
//! service access layer [`Sal`] resolves them into per-connection
//! [`DidProtocol`] instances and routes each request to the instance for its
//! protocol. A function outside a protocol's contract comes back as the
//! [`Error::InappropriateProtocolForAction`] value, never as a fault, so
//! callers can probe capabilities without side effects.
//!
//! Extended access control spans two `DIDAuthenticate` calls: the first
//! validates the certificate chain, runs PACE and opens terminal
//! authentication, handing the card's challenge out to the remote signer;
//! the second submits the signature and completes chip authentication. The
//! ephemeral key bridging the two calls lives inside [`EacProtocol`] and is
//! consumed by the second call, so a finished or failed run cannot be
//! resumed.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use perso_apdu_core::CardTransport;

use crate::ca::{ChipAuthentication, EphemeralKeyPair};
use crate::cvc::{
    CardVerifiableCertificate, CertificateChain, Chat, CvcDate, PublicKeyReference, Role,
};
use crate::error::{Error, Result};
use crate::pace::PacePassword;
use crate::pin::{PinCompare, PinInput};
use crate::securityinfo::SecurityInfos;
use crate::session::CardSession;
use crate::ta::TerminalAuthentication;

/// Protocol URI of extended access control version 2
pub const EAC_PROTOCOL: &str = "urn:oid:1.3.162.15480.3.0.14";
/// Protocol URI of the PIN comparison protocol
pub const PIN_COMPARE_PROTOCOL: &str = "urn:oid:1.3.162.15480.3.0.9";

/// The functions a DID protocol may be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ProtocolFunction {
    /// Prove an identity (`DIDAuthenticate`)
    #[display("DIDAuthenticate")]
    Authenticate,
    /// Refresh protocol-local state (`DIDUpdate`)
    #[display("DIDUpdate")]
    Update,
    /// Encrypt data under a DID's key
    #[display("Encipher")]
    Encipher,
    /// Decrypt data under a DID's key
    #[display("Decipher")]
    Decipher,
    /// Produce a signature with a DID's key
    #[display("Sign")]
    Sign,
    /// Hash data on the card
    #[display("Hash")]
    Hash,
    /// Verify a signature against a DID's key
    #[display("VerifySignature")]
    VerifySignature,
}

/// A `DIDAuthenticate` request as handed down by the application layer
#[derive(Debug)]
pub struct DidAuthenticateRequest {
    /// Name of the differential identity the request is for
    pub did: String,
    /// The protocol-specific authentication data
    pub data: AuthenticationData,
}

/// Protocol-specific payload of a `DIDAuthenticate` request
#[derive(Debug)]
pub enum AuthenticationData {
    /// First extended-access-control call: PACE plus the opening of
    /// terminal authentication
    Eac1(Eac1Input),
    /// Second extended-access-control call: the remote signature plus chip
    /// authentication
    Eac2(Eac2Input),
    /// PIN comparison against card-held reference data
    PinCompare(PinInput),
}

/// Inputs of the first extended-access-control call
#[derive(Debug)]
pub struct Eac1Input {
    /// The password keying the PACE run
    pub password: PacePassword,
    /// Certificates supplied by the relying party, in any order; the chain
    /// is assembled locally
    pub certificates: Vec<CardVerifiableCertificate>,
    /// Rights the relying party asks for; clamped to what the terminal
    /// certificate grants
    pub required_chat: Option<Chat>,
    /// Auxiliary data for checks the chip performs itself (age, document
    /// validity, community ID)
    pub auxiliary_data: Option<Bytes>,
    /// Terminal description document, bound against the certificate's
    /// description extension before any card contact
    pub certificate_description: Option<Bytes>,
    /// The chip's notion of today, for validity-period checks
    pub reference_date: CvcDate,
}

/// Inputs of the second extended-access-control call
#[derive(Debug)]
pub struct Eac2Input {
    /// Signature over the challenge binding, produced by the remote terminal
    pub signature: Bytes,
}

/// What the first extended-access-control call reports upstream
#[derive(Debug)]
pub struct Eac1Output {
    /// Remaining password tries after the PACE run
    pub retry_counter: u8,
    /// The authorization template that was announced to the card
    pub chat: Chat,
    /// The trust point the presented chain is rooted in
    pub current_car: PublicKeyReference,
    /// The previous trust point, when the card is mid-rollover
    pub previous_car: Option<PublicKeyReference>,
    /// EF.CardAccess exactly as read from the card, echoed for upstream
    /// comparison against the trusted copy
    pub ef_card_access: Bytes,
    /// Compressed chip identifier from the PACE run
    pub id_picc: Bytes,
    /// The challenge the remote terminal must sign
    pub challenge: Bytes,
}

/// What the second extended-access-control call reports upstream
#[derive(Debug)]
pub struct Eac2Output {
    /// EF.CardSecurity as read inside the authenticated channel
    pub ef_card_security: Bytes,
    /// The chip's authentication token
    pub token: Bytes,
    /// The chip's key-derivation nonce
    pub nonce: Bytes,
}

/// Protocol-specific result of a `DIDAuthenticate` request
#[derive(Debug)]
pub enum AuthenticationResponse {
    /// First extended-access-control call completed
    Eac1(Eac1Output),
    /// Second extended-access-control call completed
    Eac2(Eac2Output),
    /// PIN comparison succeeded
    PinCompare,
}

/// A DID protocol bound to one connection.
///
/// Implementations keep whatever state bridges their phases; the [`Sal`]
/// creates one instance per protocol and connection and drops it with the
/// session, so state never leaks across cards.
pub trait DidProtocol<T: CardTransport> {
    /// Whether `function` is part of this protocol's contract
    fn supports(&self, function: ProtocolFunction) -> bool;

    /// Run one authentication phase against the session's card
    fn authenticate(
        &mut self,
        session: &mut CardSession<T>,
        request: DidAuthenticateRequest,
    ) -> Result<AuthenticationResponse>;

    /// Refresh protocol-local state for `did`
    fn update(&mut self, _session: &mut CardSession<T>, _did: &str) -> Result<()> {
        Err(Error::InappropriateProtocolForAction(
            ProtocolFunction::Update,
        ))
    }
}

/// Extended access control: PACE, terminal and chip authentication.
///
/// The first call ends with the card's challenge; the ephemeral key
/// generated for terminal authentication is parked here until the second
/// call consumes it. Submitting a signature without a prior first phase, or
/// twice for one, fails with [`Error::InvalidProtocolState`].
pub struct EacProtocol<R> {
    rng: R,
    pending: Option<EphemeralKeyPair>,
}

impl<R: RngCore> EacProtocol<R> {
    /// A fresh protocol instance drawing ephemeral keys from `rng`
    pub const fn new(rng: R) -> Self {
        Self { rng, pending: None }
    }

    fn phase_one<T: CardTransport>(
        &mut self,
        session: &mut CardSession<T>,
        input: Eac1Input,
    ) -> Result<Eac1Output> {
        let Eac1Input {
            password,
            certificates,
            required_chat,
            auxiliary_data,
            certificate_description,
            reference_date,
        } = input;

        // Everything that can fail without the card fails first: chain
        // assembly, validity, description binding, CHAT clamping.
        let leaf = certificates
            .iter()
            .find(|certificate| certificate.chat().role() == Role::Terminal)
            .cloned()
            .ok_or(Error::CertificateChainInvalid(
                "no terminal certificate in the request",
            ))?;
        let chain = CertificateChain::build(leaf, |car| {
            certificates
                .iter()
                .find(|certificate| certificate.chr() == car)
                .cloned()
        })?;
        chain.verify(reference_date)?;
        check_description(chain.leaf(), certificate_description.as_deref())?;

        let chat = match required_chat {
            Some(mut requested) => {
                requested.restrict_to(chain.leaf().chat())?;
                requested
            }
            None => chain.leaf().chat().clone(),
        };

        let pace = session.establish_pace(&password, Some(&chat), &mut self.rng)?;
        let current_car = pace
            .current_car
            .ok_or(Error::CertificateChainInvalid(
                "card announced no trust point",
            ))?;
        let presented = chain
            .presentation_order(&current_car)
            .or_else(|error| match &pace.previous_car {
                Some(previous) => chain.presentation_order(previous),
                None => Err(error),
            })?;

        let ephemeral = EphemeralKeyPair::generate(session.card_access(), &mut self.rng)?;
        let mut authentication = TerminalAuthentication::new(session.executor());
        authentication.present_certificates(presented)?;
        authentication.announce(
            chain.leaf(),
            &ephemeral.compressed(),
            auxiliary_data.as_deref(),
        )?;
        let challenge = authentication.request_challenge()?;

        self.pending = Some(ephemeral);
        debug!(car = %current_car, "Terminal authentication opened, challenge issued");
        Ok(Eac1Output {
            retry_counter: pace.retry_counter,
            chat,
            current_car,
            previous_car: pace.previous_car,
            ef_card_access: session.card_access().raw().clone(),
            id_picc: pace.id_picc,
            challenge,
        })
    }

    fn phase_two<T: CardTransport>(
        &mut self,
        session: &mut CardSession<T>,
        did: &str,
        input: Eac2Input,
    ) -> Result<Eac2Output> {
        let ephemeral = self.pending.take().ok_or(Error::InvalidProtocolState(
            "terminal authentication has not started",
        ))?;
        TerminalAuthentication::new(session.executor()).authenticate(input.signature)?;

        let raw = session.read_ef_card_security()?;
        let card_security = SecurityInfos::parse(raw.clone())?;
        let output = ChipAuthentication::new(session.executor(), &card_security)?
            .authenticate(&ephemeral, &card_security)?;

        session.mark_authenticated(did);
        Ok(Eac2Output {
            ef_card_security: raw,
            token: output.token,
            nonce: output.nonce,
        })
    }
}

impl<R> fmt::Debug for EacProtocol<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EacProtocol")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<T: CardTransport, R: RngCore> DidProtocol<T> for EacProtocol<R> {
    fn supports(&self, function: ProtocolFunction) -> bool {
        function == ProtocolFunction::Authenticate
    }

    fn authenticate(
        &mut self,
        session: &mut CardSession<T>,
        request: DidAuthenticateRequest,
    ) -> Result<AuthenticationResponse> {
        match request.data {
            AuthenticationData::Eac1(input) => {
                Ok(AuthenticationResponse::Eac1(self.phase_one(session, input)?))
            }
            AuthenticationData::Eac2(input) => Ok(AuthenticationResponse::Eac2(
                self.phase_two(session, &request.did, input)?,
            )),
            AuthenticationData::PinCompare(_) => Err(Error::InvalidProtocolState(
                "PIN comparison data sent to the EAC protocol",
            )),
        }
    }
}

/// Verify that `description` is the document the terminal certificate
/// certifies: its SHA-256 hash must equal the certificate's description
/// extension. No description means nothing to check.
fn check_description(
    terminal: &CardVerifiableCertificate,
    description: Option<&[u8]>,
) -> Result<()> {
    let Some(description) = description else {
        return Ok(());
    };
    let certified = terminal
        .description_hash()?
        .ok_or(Error::CertificateChainInvalid(
            "terminal certificate certifies no description",
        ))?;
    if Sha256::digest(description).as_slice() != certified.as_ref() {
        return Err(Error::CertificateChainInvalid(
            "description does not match the terminal certificate",
        ));
    }
    Ok(())
}

/// PIN comparison: one VERIFY inside the established channel.
///
/// The update phase carries no protocol state and acknowledges immediately.
#[derive(Debug, Default)]
pub struct PinCompareProtocol;

impl PinCompareProtocol {
    /// A fresh protocol instance
    pub const fn new() -> Self {
        Self
    }
}

impl<T: CardTransport> DidProtocol<T> for PinCompareProtocol {
    fn supports(&self, function: ProtocolFunction) -> bool {
        matches!(
            function,
            ProtocolFunction::Authenticate | ProtocolFunction::Update
        )
    }

    fn authenticate(
        &mut self,
        session: &mut CardSession<T>,
        request: DidAuthenticateRequest,
    ) -> Result<AuthenticationResponse> {
        let AuthenticationData::PinCompare(input) = request.data else {
            return Err(Error::InvalidProtocolState(
                "EAC data sent to the PIN comparison protocol",
            ));
        };
        let pinpad = session.has_pinpad();
        PinCompare::new(session.executor())
            .with_pinpad(pinpad)
            .authenticate(input)?;
        session.mark_authenticated(&request.did);
        Ok(AuthenticationResponse::PinCompare)
    }

    fn update(&mut self, _session: &mut CardSession<T>, did: &str) -> Result<()> {
        debug!(did, "Nothing to update for a PIN comparison DID");
        Ok(())
    }
}

type ProtocolFactory<T> = Box<dyn Fn() -> Box<dyn DidProtocol<T>> + Send + Sync>;

/// The protocols a [`Sal`] can instantiate, keyed by protocol URI
pub struct ProtocolRegistry<T: CardTransport> {
    factories: BTreeMap<String, ProtocolFactory<T>>,
}

impl<T: CardTransport> ProtocolRegistry<T> {
    /// An empty registry
    pub const fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// The bundled protocols: extended access control under
    /// [`EAC_PROTOCOL`] and PIN comparison under [`PIN_COMPARE_PROTOCOL`]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EAC_PROTOCOL, || Box::new(EacProtocol::new(rand::rng())));
        registry.register(PIN_COMPARE_PROTOCOL, || Box::new(PinCompareProtocol::new()));
        registry
    }

    /// Register `factory` for `protocol`, replacing any previous entry
    pub fn register<F>(&mut self, protocol: &str, factory: F)
    where
        F: Fn() -> Box<dyn DidProtocol<T>> + Send + Sync + 'static,
    {
        self.factories.insert(protocol.to_owned(), Box::new(factory));
    }

    /// A fresh instance of the protocol registered under `protocol`
    pub fn create(&self, protocol: &str) -> Option<Box<dyn DidProtocol<T>>> {
        self.factories.get(protocol).map(|factory| factory())
    }
}

impl<T: CardTransport> Default for ProtocolRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CardTransport> fmt::Debug for ProtocolRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The service access layer for one connection.
///
/// Owns the [`CardSession`] and the protocol instances running on it.
/// Instances are created from the registry on first use and cached for the
/// life of the connection, so a protocol's phases share state.
pub struct Sal<T: CardTransport> {
    session: CardSession<T>,
    registry: ProtocolRegistry<T>,
    active: BTreeMap<String, Box<dyn DidProtocol<T>>>,
}

impl<T: CardTransport> Sal<T> {
    /// Wrap a connected session with `registry`'s protocol set
    pub const fn new(session: CardSession<T>, registry: ProtocolRegistry<T>) -> Self {
        Self {
            session,
            registry,
            active: BTreeMap::new(),
        }
    }

    /// The underlying session
    pub const fn session(&self) -> &CardSession<T> {
        &self.session
    }

    /// The underlying session, for work outside any DID protocol
    pub const fn session_mut(&mut self) -> &mut CardSession<T> {
        &mut self.session
    }

    /// Route a `DIDAuthenticate` to the instance serving `protocol`
    pub fn did_authenticate(
        &mut self,
        protocol: &str,
        request: DidAuthenticateRequest,
    ) -> Result<AuthenticationResponse> {
        let instance = instance(&mut self.active, &self.registry, protocol)?;
        if !instance.supports(ProtocolFunction::Authenticate) {
            return Err(Error::InappropriateProtocolForAction(
                ProtocolFunction::Authenticate,
            ));
        }
        instance.authenticate(&mut self.session, request)
    }

    /// Route a `DIDUpdate` to the instance serving `protocol`
    pub fn did_update(&mut self, protocol: &str, did: &str) -> Result<()> {
        let instance = instance(&mut self.active, &self.registry, protocol)?;
        if !instance.supports(ProtocolFunction::Update) {
            return Err(Error::InappropriateProtocolForAction(
                ProtocolFunction::Update,
            ));
        }
        instance.update(&mut self.session, did)
    }

    /// Gate `function` on the contract of `protocol`.
    ///
    /// Entry point for the remaining DID functions. The card-bound side of
    /// enciphering, deciphering and signing lives with the card's
    /// applications, not here; what every caller needs first is the
    /// contract check, and a function outside it comes back as the
    /// [`Error::InappropriateProtocolForAction`] value.
    pub fn invoke(&mut self, protocol: &str, function: ProtocolFunction) -> Result<()> {
        let instance = instance(&mut self.active, &self.registry, protocol)?;
        if instance.supports(function) {
            Ok(())
        } else {
            Err(Error::InappropriateProtocolForAction(function))
        }
    }
}

impl<T: CardTransport> fmt::Debug for Sal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sal")
            .field("session", &self.session)
            .field("active", &self.active.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The cached instance serving `protocol`, created on first use
fn instance<'a, T: CardTransport>(
    active: &'a mut BTreeMap<String, Box<dyn DidProtocol<T>>>,
    registry: &ProtocolRegistry<T>,
    protocol: &str,
) -> Result<&'a mut Box<dyn DidProtocol<T>>> {
    match active.entry(protocol.to_owned()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(slot) => {
            let instance = registry
                .create(protocol)
                .ok_or_else(|| Error::UnsupportedProtocol(protocol.to_owned()))?;
            debug!(protocol, "Protocol instance created");
            Ok(slot.insert(instance))
        }
    }
}
