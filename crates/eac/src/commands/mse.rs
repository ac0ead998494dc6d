//! MANAGE SECURITY ENVIRONMENT (INS 0x22)
//!
//! Four flavors serve the authentication stack: MSE:Set AT announcing PACE,
//! terminal authentication or chip authentication, and MSE:Set DST naming the
//! verification key for the next certificate. The PACE variant gets its own
//! type because its status word grades the password state instead of simply
//! succeeding or failing.

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response, StatusWord};

use super::{CLA_PLAIN, unexpected_status};
use crate::cvc::{Chat, PublicKeyReference};
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::tlv::TlvWriter;

const INS_MSE: u8 = 0x22;
const P1P2_SET_AT_PACE: (u8, u8) = (0xC1, 0xA4);
const P1P2_SET_AT_TA: (u8, u8) = (0x81, 0xA4);
const P1P2_SET_AT_CA: (u8, u8) = (0x41, 0xA4);
const P1P2_SET_DST: (u8, u8) = (0x81, 0xB6);

const TAG_PROTOCOL: u32 = 0x80;
const TAG_KEY_REFERENCE: u32 = 0x83;
const TAG_PRIVATE_KEY_REFERENCE: u32 = 0x84;
const TAG_EPHEMERAL_KEY: u32 = 0x91;

/// The password a PACE run is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PasswordType {
    /// Machine readable zone of an ICAO travel document
    #[display("MRZ")]
    Mrz,
    /// Card access number printed on the front of the card
    #[display("CAN")]
    Can,
    /// The secret eID PIN
    #[display("PIN")]
    Pin,
    /// Unblocking key from the PIN letter
    #[display("PUK")]
    Puk,
}

impl PasswordType {
    /// Password reference carried in the 0x83 data object
    pub const fn reference(self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
            Self::Pin => 0x03,
            Self::Puk => 0x04,
        }
    }
}

/// Password state as graded by the card's answer to the PACE MSE:Set AT.
///
/// The grading reads the `63 Cx` retry counter nibble the way the German eID
/// card profile defines it: counter 1 means the PIN is suspended until a
/// CAN-keyed PACE run succeeds, counter 0 means blocked until a PUK run
/// resets it. Other card profiles may use the nibble differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStatus {
    /// Password usable, `tries` attempts remain
    Ready {
        /// Remaining verification attempts
        tries: u8,
    },
    /// Retry counter at 1; a CAN run must precede the next PIN attempt
    Suspended,
    /// Retry counter exhausted; only the PUK can reset it
    Blocked,
    /// The eID function is switched off
    Deactivated,
}

impl PasswordStatus {
    pub(crate) fn from_status(status: StatusWord) -> Option<Self> {
        if status.is_success() {
            return Some(Self::Ready { tries: 3 });
        }
        if status.is_file_deactivated() {
            return Some(Self::Deactivated);
        }
        match status.retry_counter() {
            Some(0) => Some(Self::Blocked),
            Some(1) => Some(Self::Suspended),
            Some(tries) => Some(Self::Ready { tries }),
            None => None,
        }
    }

    /// Remaining attempts, counting suspended as one and blocked as none
    pub const fn tries_left(self) -> u8 {
        match self {
            Self::Ready { tries } => tries,
            Self::Suspended => 1,
            Self::Blocked | Self::Deactivated => 0,
        }
    }

    /// The status as a result, for flows that cannot proceed otherwise
    pub const fn require_usable(self) -> Result<u8> {
        match self {
            Self::Ready { tries } => Ok(tries),
            Self::Suspended => Err(Error::PasswordSuspended),
            Self::Blocked => Err(Error::PasswordBlocked),
            Self::Deactivated => Err(Error::CardDeactivated),
        }
    }
}

/// MSE:Set AT opening a PACE run, also sent alone as a password status probe
#[derive(Debug, Clone)]
pub struct PaceMseSetAt {
    data: Bytes,
}

impl PaceMseSetAt {
    /// Announce `protocol` keyed on `password`, with the terminal's requested
    /// CHAT and an explicit domain parameter id when the card offers several
    pub fn new(
        protocol: &Oid,
        password: PasswordType,
        parameter_id: Option<i32>,
        chat: Option<&Chat>,
    ) -> Self {
        let mut writer = TlvWriter::new();
        writer.primitive(TAG_PROTOCOL, protocol.encoded());
        writer.primitive(TAG_KEY_REFERENCE, &[password.reference()]);
        if let Some(id) = parameter_id {
            writer.primitive(TAG_PRIVATE_KEY_REFERENCE, &unsigned_bytes(id));
        }
        if let Some(chat) = chat {
            writer.raw(&chat.encode());
        }
        Self {
            data: writer.into_bytes(),
        }
    }
}

impl ApduCommand for PaceMseSetAt {
    type Success = PasswordStatus;
    type Error = Error;

    fn to_command(&self) -> Command {
        let (p1, p2) = P1P2_SET_AT_PACE;
        Command::new_with_data(CLA_PLAIN, INS_MSE, p1, p2, self.data.clone())
    }

    fn parse_response(response: Response) -> Result<PasswordStatus> {
        let status = response.status();
        PasswordStatus::from_status(status).ok_or_else(|| unexpected_status(status))
    }
}

/// MSE:Set AT / MSE:Set DST for the authentication steps after PACE
#[derive(Debug, Clone)]
pub struct ManageSecurityEnvironment {
    p1: u8,
    p2: u8,
    data: Bytes,
}

impl ManageSecurityEnvironment {
    /// MSE:Set DST naming the public key verifying the next certificate
    pub fn set_dst(car: &PublicKeyReference) -> Self {
        let mut writer = TlvWriter::new();
        writer.primitive(TAG_KEY_REFERENCE, car.as_bytes());
        let (p1, p2) = P1P2_SET_DST;
        Self {
            p1,
            p2,
            data: writer.into_bytes(),
        }
    }

    /// MSE:Set AT binding terminal authentication to the terminal key, the
    /// compressed ephemeral chip authentication key and any auxiliary data
    /// (an already encoded 0x67 template, appended verbatim)
    pub fn terminal_authentication(
        protocol: &Oid,
        chr: &PublicKeyReference,
        compressed_ephemeral_key: &[u8],
        auxiliary_data: Option<&[u8]>,
    ) -> Self {
        let mut writer = TlvWriter::new();
        writer.primitive(TAG_PROTOCOL, protocol.encoded());
        writer.primitive(TAG_KEY_REFERENCE, chr.as_bytes());
        writer.primitive(TAG_EPHEMERAL_KEY, compressed_ephemeral_key);
        if let Some(aux) = auxiliary_data {
            writer.raw(aux);
        }
        let (p1, p2) = P1P2_SET_AT_TA;
        Self {
            p1,
            p2,
            data: writer.into_bytes(),
        }
    }

    /// MSE:Set AT choosing the chip authentication suite and static chip key
    pub fn chip_authentication(protocol: &Oid, key_id: Option<i32>) -> Self {
        let mut writer = TlvWriter::new();
        writer.primitive(TAG_PROTOCOL, protocol.encoded());
        if let Some(id) = key_id {
            writer.primitive(TAG_PRIVATE_KEY_REFERENCE, &unsigned_bytes(id));
        }
        let (p1, p2) = P1P2_SET_AT_CA;
        Self {
            p1,
            p2,
            data: writer.into_bytes(),
        }
    }
}

impl ApduCommand for ManageSecurityEnvironment {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new_with_data(CLA_PLAIN, INS_MSE, self.p1, self.p2, self.data.clone())
    }

    fn parse_response(response: Response) -> Result<()> {
        response.into_payload().map(drop).map_err(Error::from)
    }
}

/// Minimal big-endian encoding of a non-negative reference id
fn unsigned_bytes(value: i32) -> Vec<u8> {
    debug_assert!(value >= 0);
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    bytes[start..].to_vec()
}
