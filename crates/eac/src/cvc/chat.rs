//! Certificate holder authorization template (CHAT), TR-03110 part 3
//! appendix C.4.
//!
//! The template is an application-tagged object carrying the terminal type
//! OID and a discretionary-data bit string: one byte for inspection and
//! signature terminals, five bytes for authentication terminals. Bits are
//! indexed MSB-first across the string.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::tlv::{NodeId, Tag, TlvArena, TlvWriter};

const TAG_OID: u32 = 0x06;
const TAG_DISCRETIONARY_DATA: u32 = 0x53;

/// Terminal flavor, determined by the CHAT object identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalType {
    /// Inspection system (ePassport border control)
    InspectionSystem,
    /// Authentication terminal (eID online authentication)
    AuthenticationTerminal,
    /// Signature terminal
    SignatureTerminal,
}

impl TerminalType {
    fn from_oid(oid: &Oid) -> Result<Self> {
        if *oid == Oid::TERMINAL_TYPE_IS {
            Ok(Self::InspectionSystem)
        } else if *oid == Oid::TERMINAL_TYPE_AT {
            Ok(Self::AuthenticationTerminal)
        } else if *oid == Oid::TERMINAL_TYPE_ST {
            Ok(Self::SignatureTerminal)
        } else {
            Err(Error::UnsupportedProtocol(oid.to_string()))
        }
    }

    /// The object identifier naming this terminal type
    pub fn oid(self) -> Oid {
        match self {
            Self::InspectionSystem => Oid::TERMINAL_TYPE_IS,
            Self::AuthenticationTerminal => Oid::TERMINAL_TYPE_AT,
            Self::SignatureTerminal => Oid::TERMINAL_TYPE_ST,
        }
    }

    const fn data_len(self) -> usize {
        match self {
            Self::AuthenticationTerminal => 5,
            Self::InspectionSystem | Self::SignatureTerminal => 1,
        }
    }
}

/// Certificate holder role, encoded in the two top bits of the
/// authorization data
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Country verifying certification authority
    Cvca,
    /// Document verifier, official domestic
    DvOfficial,
    /// Document verifier, non-official / foreign
    DvNonOfficial,
    /// End-entity terminal (meaning depends on the terminal type)
    Terminal,
}

impl Role {
    const fn from_bits(byte: u8) -> Self {
        match byte & 0xC0 {
            0xC0 => Self::Cvca,
            0x80 => Self::DvOfficial,
            0x40 => Self::DvNonOfficial,
            _ => Self::Terminal,
        }
    }

    /// Position in the certification hierarchy; issuers must outrank holders
    pub(crate) const fn rank(self) -> u8 {
        match self {
            Self::Cvca => 2,
            Self::DvOfficial | Self::DvNonOfficial => 1,
            Self::Terminal => 0,
        }
    }
}

/// eID application data groups DG1 through DG21
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum DataGroup {
    Dg1 = 1,
    Dg2,
    Dg3,
    Dg4,
    Dg5,
    Dg6,
    Dg7,
    Dg8,
    Dg9,
    Dg10,
    Dg11,
    Dg12,
    Dg13,
    Dg14,
    Dg15,
    Dg16,
    Dg17,
    Dg18,
    Dg19,
    Dg20,
    Dg21,
}

impl DataGroup {
    /// Read-access bit position: DG1 occupies bit 31, DG21 bit 11
    const fn read_bit(self) -> usize {
        32 - self as usize
    }

    /// Write-access bit position; only DG17 through DG21 are writable
    const fn write_bit(self) -> Option<usize> {
        let n = self as usize;
        if n >= 17 { Some(n - 15) } else { None }
    }
}

/// Special functions of an authentication terminal, bits 32 through 39
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpecialFunction {
    /// Install qualified signature certificates
    InstallQualifiedCertificate = 32,
    /// Install signature certificates
    InstallCertificate,
    /// Change or unblock the PIN
    PinManagement,
    /// PACE with CAN is sufficient for this terminal
    CanAllowed,
    /// Privileged terminal (may read the restricted-identification group)
    PrivilegedTerminal,
    /// Restricted identification (pseudonymous identifier)
    RestrictedIdentification,
    /// Community ID verification (place-of-residence check)
    CommunityIdVerification,
    /// Age verification without disclosing the birth date
    AgeVerification,
}

/// A certificate holder authorization template
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chat {
    terminal_type: TerminalType,
    data: Vec<u8>,
}

impl Chat {
    /// An authentication-terminal template with no rights granted
    pub fn new_authentication_terminal() -> Self {
        Self {
            terminal_type: TerminalType::AuthenticationTerminal,
            data: vec![0; 5],
        }
    }

    /// Parse a standalone `7F4C` template
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let arena = TlvArena::parse(bytes.to_vec())?;
        let root = arena
            .root_tagged(Tag::CHAT)
            .ok_or(Error::MalformedEncoding("expected an authorization template"))?;
        Self::from_node(&arena, root)
    }

    pub(crate) fn from_node(arena: &TlvArena, node: NodeId) -> Result<Self> {
        let oid_node = arena
            .child_tagged(node, TAG_OID)
            .ok_or(Error::MalformedEncoding("authorization template without OID"))?;
        let data_node = arena.child_tagged(node, TAG_DISCRETIONARY_DATA).ok_or(
            Error::MalformedEncoding("authorization template without discretionary data"),
        )?;

        let oid = Oid::from_encoded(arena.value(oid_node).to_vec())?;
        let terminal_type = TerminalType::from_oid(&oid)?;
        let data = arena.value(data_node).to_vec();
        if data.len() != terminal_type.data_len() {
            return Err(Error::MalformedEncoding(
                "authorization data length does not match the terminal type",
            ));
        }
        Ok(Self {
            terminal_type,
            data,
        })
    }

    /// Serialize as a `7F4C` template
    pub fn encode(&self) -> Bytes {
        let mut writer = TlvWriter::new();
        writer.constructed(Tag::CHAT, |w| {
            w.primitive(TAG_OID, self.terminal_type.oid().encoded());
            w.primitive(TAG_DISCRETIONARY_DATA, &self.data);
        });
        writer.into_bytes()
    }

    /// The terminal type this template was issued for
    pub fn terminal_type(&self) -> TerminalType {
        self.terminal_type
    }

    /// The role of the certificate holder
    pub fn role(&self) -> Role {
        Role::from_bits(self.data[0])
    }

    fn bit(&self, index: usize) -> bool {
        self.data[index / 8] >> (7 - index % 8) & 1 != 0
    }

    fn put_bit(&mut self, index: usize, enabled: bool) {
        let mask = 1 << (7 - index % 8);
        if enabled {
            self.data[index / 8] |= mask;
        } else {
            self.data[index / 8] &= !mask;
        }
    }

    const fn is_at(&self) -> bool {
        matches!(self.terminal_type, TerminalType::AuthenticationTerminal)
    }

    /// Read access to a data group (authentication terminals only)
    pub fn read_access(&self, group: DataGroup) -> bool {
        self.is_at() && self.bit(group.read_bit())
    }

    /// Grant or revoke read access; returns false when this template
    /// carries no such bit
    pub fn set_read_access(&mut self, group: DataGroup, enabled: bool) -> bool {
        if !self.is_at() {
            return false;
        }
        self.put_bit(group.read_bit(), enabled);
        true
    }

    /// Write access to a data group; only DG17 through DG21 are writable
    pub fn write_access(&self, group: DataGroup) -> bool {
        self.is_at() && group.write_bit().is_some_and(|bit| self.bit(bit))
    }

    /// Grant or revoke write access; returns false when this template
    /// carries no such bit
    pub fn set_write_access(&mut self, group: DataGroup, enabled: bool) -> bool {
        match group.write_bit() {
            Some(bit) if self.is_at() => {
                self.put_bit(bit, enabled);
                true
            }
            _ => false,
        }
    }

    /// Whether a special function is granted (authentication terminals only)
    pub fn special_function(&self, function: SpecialFunction) -> bool {
        self.is_at() && self.bit(function as usize)
    }

    /// Grant or revoke a special function; returns false when this template
    /// carries no such bit
    pub fn set_special_function(&mut self, function: SpecialFunction, enabled: bool) -> bool {
        if !self.is_at() {
            return false;
        }
        self.put_bit(function as usize, enabled);
        true
    }

    /// Read access to ePassport DG3 (fingerprint), inspection systems only
    pub fn read_fingerprint(&self) -> bool {
        self.terminal_type == TerminalType::InspectionSystem && self.bit(7)
    }

    /// Read access to ePassport DG4 (iris), inspection systems only
    pub fn read_iris(&self) -> bool {
        self.terminal_type == TerminalType::InspectionSystem && self.bit(6)
    }

    /// Right to generate electronic signatures, signature terminals only
    pub fn generate_signature(&self) -> bool {
        self.terminal_type == TerminalType::SignatureTerminal && self.bit(7)
    }

    /// Right to generate qualified electronic signatures, signature
    /// terminals only
    pub fn generate_qualified_signature(&self) -> bool {
        self.terminal_type == TerminalType::SignatureTerminal && self.bit(6)
    }

    /// Intersect this template with `mask`, clearing every right the mask
    /// does not grant. The role bits are kept as-is. No bit of the result
    /// can be set where the mask bit is clear, so a requested authorization
    /// can never exceed what the terminal certificate allows.
    pub fn restrict_to(&mut self, mask: &Self) -> Result<()> {
        if self.terminal_type != mask.terminal_type {
            return Err(Error::CertificateFormat(
                "authorization templates are for different terminal types",
            ));
        }
        let role_bits = self.data[0] & 0xC0;
        for (byte, mask_byte) in self.data.iter_mut().zip(&mask.data) {
            *byte &= mask_byte;
        }
        self.data[0] = (self.data[0] & 0x3F) | role_bits;
        Ok(())
    }
}
