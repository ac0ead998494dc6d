//! Connection state for one card: the secure channel executor, the parsed
//! EF.CardAccess and the authorization bookkeeping protocols feed.
//!
//! A session starts unauthenticated on a plaintext channel. PACE upgrades
//! the channel to password-derived keys, chip authentication re-keys it once
//! more, and each protocol that completes records its DID here so later
//! calls can check what the connection has already proven.

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, Zeroizing};

use perso_apdu_core::{CardExecutor, CardTransport, Executor, SecureChannel};

use crate::commands::{
    EF_CARD_ACCESS, EF_CARD_SECURITY, PasswordStatus, PasswordType, ReadBinary,
    ResetRetryCounter, Select,
};
use crate::cvc::Chat;
use crate::error::{Error, Result};
use crate::pace::{Pace, PaceOutput, PacePassword};
use crate::secure_messaging::EacSecureChannel;
use crate::securityinfo::SecurityInfos;

/// A connection to the eID application of one card.
///
/// Owns the executor with its secure messaging channel, the announcements
/// read from EF.CardAccess at connect time, and the set of DIDs that have
/// authenticated on this connection.
#[derive(Debug)]
pub struct CardSession<T: CardTransport> {
    executor: CardExecutor<EacSecureChannel<T>>,
    card_access: SecurityInfos,
    authenticated: BTreeSet<String>,
    pinpad: bool,
}

impl<T: CardTransport> CardSession<T> {
    /// Open a session over `transport`: select the master file and read
    /// EF.CardAccess, whose announcements drive every later negotiation
    pub fn connect(transport: T) -> Result<Self> {
        let mut executor = CardExecutor::new(EacSecureChannel::new(transport));
        executor.execute(&Select::master_file())?;
        let raw = read_elementary_file(&mut executor, EF_CARD_ACCESS)?;
        let card_access = SecurityInfos::parse(raw)?;
        debug!(
            announcements = card_access.iter().count(),
            "Session opened, EF.CardAccess read"
        );
        Ok(Self {
            executor,
            card_access,
            authenticated: BTreeSet::new(),
            pinpad: false,
        })
    }

    /// Declare that the reader collects digits on its own pad
    pub fn with_pinpad(mut self) -> Self {
        self.pinpad = true;
        self
    }

    /// Whether the reader collects digits on its own pad
    pub const fn has_pinpad(&self) -> bool {
        self.pinpad
    }

    /// The card's announcements from EF.CardAccess
    pub const fn card_access(&self) -> &SecurityInfos {
        &self.card_access
    }

    /// The executor, for protocol steps driving it directly
    pub fn executor(&mut self) -> &mut CardExecutor<EacSecureChannel<T>> {
        &mut self.executor
    }

    /// Whether secure messaging currently protects the connection
    pub fn is_secure(&self) -> bool {
        self.executor.transport().is_established()
    }

    /// Record that `did` has authenticated on this connection
    pub fn mark_authenticated(&mut self, did: &str) {
        debug!(did, "DID authenticated");
        self.authenticated.insert(did.to_owned());
    }

    /// Whether `did` has authenticated on this connection
    pub fn is_authenticated(&self, did: &str) -> bool {
        self.authenticated.contains(did)
    }

    /// Ask the card for the state of `kind` without spending an attempt.
    ///
    /// Sends the PACE MSE:Set AT probe; the card grades the password in its
    /// status word before any cryptography starts.
    pub fn password_status(&mut self, kind: PasswordType) -> Result<PasswordStatus> {
        Pace::new(&mut self.executor, &self.card_access)?.password_status(kind)
    }

    /// Run PACE with `password` and install the session keys
    pub fn establish_pace<R: RngCore + ?Sized>(
        &mut self,
        password: &PacePassword,
        chat: Option<&Chat>,
        rng: &mut R,
    ) -> Result<PaceOutput> {
        Pace::new(&mut self.executor, &self.card_access)?.establish(password, chat, rng)
    }

    /// Run PACE with `password`, lifting a suspension first.
    ///
    /// Probes the password state: a counter at one means the card demands a
    /// CAN exchange before it accepts the last try, so one runs with `can`
    /// and the password run follows inside the CAN-keyed channel. Blocked
    /// and deactivated states fail without spending anything.
    pub fn establish_pace_with_recovery<R: RngCore + ?Sized>(
        &mut self,
        password: &PacePassword,
        can: &PacePassword,
        chat: Option<&Chat>,
        rng: &mut R,
    ) -> Result<PaceOutput> {
        match self.password_status(password.kind())? {
            PasswordStatus::Ready { tries } => {
                trace!(tries, "password usable");
            }
            PasswordStatus::Suspended => {
                warn!(kind = %password.kind(), "suspended, running a CAN exchange first");
                self.establish_pace(can, None, rng)?;
            }
            PasswordStatus::Blocked => return Err(Error::PasswordBlocked),
            PasswordStatus::Deactivated => return Err(Error::CardDeactivated),
        }
        self.establish_pace(password, chat, rng)
    }

    /// Reset the PIN retry counter. The card accepts this only inside a
    /// channel keyed by the PUK.
    pub fn unblock_pin(&mut self) -> Result<()> {
        self.require_secure("unblocking needs a PUK-keyed channel")?;
        self.executor
            .execute(&ResetRetryCounter::unblock(PasswordType::Pin))?;
        debug!("PIN retry counter reset");
        Ok(())
    }

    /// Give the PIN a new value, scrubbing `digits` in place. The card
    /// accepts this only inside a channel keyed by the current PIN.
    pub fn change_pin(&mut self, digits: &mut [u8]) -> Result<()> {
        let new_value = Zeroizing::new(digits.to_vec());
        digits.zeroize();
        self.require_secure("changing the PIN needs a PIN-keyed channel")?;
        self.executor
            .execute(&ResetRetryCounter::set_new(PasswordType::Pin, new_value))?;
        debug!("PIN changed");
        Ok(())
    }

    /// Read EF.CardSecurity. The card releases it only after terminal
    /// authentication, so this belongs between the two EAC phases.
    pub fn read_ef_card_security(&mut self) -> Result<Bytes> {
        self.read_file(EF_CARD_SECURITY)
    }

    /// Select a transparent file under the master file and read it whole
    pub fn read_file(&mut self, fid: u16) -> Result<Bytes> {
        read_elementary_file(&mut self.executor, fid)
    }

    fn require_secure(&self, context: &'static str) -> Result<()> {
        if self.is_secure() {
            Ok(())
        } else {
            Err(Error::InvalidProtocolState(context))
        }
    }
}

/// Select `fid` and drain it with chained reads.
///
/// The card ends the loop by answering with a short chunk followed by an
/// out-of-window status, both of which [`ReadBinary`] grades as empty.
fn read_elementary_file<T: CardTransport>(
    executor: &mut CardExecutor<EacSecureChannel<T>>,
    fid: u16,
) -> Result<Bytes> {
    executor.execute(&Select::elementary_file(fid))?;

    let mut contents = BytesMut::new();
    loop {
        let offset = u16::try_from(contents.len())
            .ok()
            .filter(|offset| *offset < 0x8000)
            .ok_or(Error::MalformedEncoding(
                "file exceeds short read binary offsets",
            ))?;
        let chunk = executor.execute(&ReadBinary::at_offset(offset, 0))?;
        if chunk.is_empty() {
            break;
        }
        contents.put_slice(&chunk);
    }
    trace!(fid, len = contents.len(), "Elementary file read");
    Ok(contents.freeze())
}
