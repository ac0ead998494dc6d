//! Card-verifiable certificates, TR-03110 part 3 appendix C.
//!
//! A CV certificate is a `7F21` template holding the certificate body
//! (`7F4E`) and a signature (`5F37`) over that body. The body carries the
//! profile identifier, issuer and holder references, the subject public
//! key, the holder authorization template and the validity period. The
//! chip, not the terminal, verifies the signatures; this type therefore
//! parses and re-emits certificates but performs no signature checks.

use std::fmt;

use bytes::Bytes;

use crate::cvc::chat::Chat;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::tlv::{NodeId, Tag, TlvArena};

const TAG_CPI: u32 = 0x5F29;
const TAG_CAR: u32 = 0x42;
const TAG_CHR: u32 = 0x5F20;
const TAG_PUBLIC_KEY: u32 = 0x7F49;
const TAG_CHAT: u32 = 0x7F4C;
const TAG_SIGNATURE: u32 = 0x5F37;
const TAG_EFFECTIVE_DATE: u32 = 0x5F25;
const TAG_EXPIRATION_DATE: u32 = 0x5F24;
const TAG_EXTENSIONS: u32 = 0x65;
const TAG_DISCRETIONARY_DATA: u32 = 0x73;
const TAG_OID: u32 = 0x06;
const TAG_PUBLIC_POINT: u32 = 0x86;
const TAG_CONTEXT_0: u32 = 0x80;

/// A certification authority or holder reference (CAR/CHR): country code,
/// holder mnemonic and sequence number in printable ASCII
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PublicKeyReference {
    value: String,
}

impl PublicKeyReference {
    /// Parse a reference: 2 characters of country code, up to 9 of holder
    /// mnemonic, 5 of sequence number
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if !(7..=16).contains(&bytes.len()) {
            return Err(Error::CertificateFormat("key reference length"));
        }
        if !bytes.iter().all(u8::is_ascii_alphanumeric) {
            return Err(Error::CertificateFormat(
                "key reference contains non-alphanumeric characters",
            ));
        }
        let value = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::CertificateFormat("key reference charset"))?;
        Ok(Self { value })
    }

    /// ISO 3166-1 alpha-2 country code
    pub fn country(&self) -> &str {
        &self.value[..2]
    }

    /// Holder mnemonic, possibly empty
    pub fn holder_mnemonic(&self) -> &str {
        &self.value[2..self.value.len() - 5]
    }

    /// Five-character sequence number
    pub fn sequence(&self) -> &str {
        &self.value[self.value.len() - 5..]
    }

    /// The reference as transmitted on the wire
    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

impl fmt::Display for PublicKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A certificate validity date, six unpacked BCD digits `YYMMDD` with the
/// century fixed to 20xx
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CvcDate {
    year: u16,
    month: u8,
    day: u8,
}

impl CvcDate {
    /// Build a date; values are taken as-is
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// Parse six digit bytes, each holding one decimal digit
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let digits: &[u8; 6] = bytes
            .try_into()
            .map_err(|_| Error::CertificateFormat("date must be six digit bytes"))?;
        if digits.iter().any(|&d| d > 9) {
            return Err(Error::CertificateFormat("date digit out of range"));
        }
        let date = Self {
            year: 2000 + u16::from(digits[0]) * 10 + u16::from(digits[1]),
            month: digits[2] * 10 + digits[3],
            day: digits[4] * 10 + digits[5],
        };
        if !(1..=12).contains(&date.month) || !(1..=31).contains(&date.day) {
            return Err(Error::CertificateFormat("date out of range"));
        }
        Ok(date)
    }

    /// Encode as six digit bytes
    pub fn encode(&self) -> [u8; 6] {
        let yy = (self.year % 100) as u8;
        [
            yy / 10,
            yy % 10,
            self.month / 10,
            self.month % 10,
            self.day / 10,
            self.day % 10,
        ]
    }

    /// Calendar year
    pub const fn year(&self) -> u16 {
        self.year
    }

    /// Calendar month, 1 through 12
    pub const fn month(&self) -> u8 {
        self.month
    }

    /// Day of month
    pub const fn day(&self) -> u8 {
        self.day
    }
}

/// The subject public key of a CV certificate (`7F49`)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CvcPublicKey {
    protocol: Oid,
    point: Option<Bytes>,
    raw: Bytes,
}

impl CvcPublicKey {
    fn from_node(arena: &TlvArena, node: NodeId) -> Result<Self> {
        let oid_node = arena
            .child_tagged(node, TAG_OID)
            .ok_or(Error::CertificateFormat("public key without protocol OID"))?;
        let protocol = Oid::from_encoded(arena.value(oid_node).to_vec())?;
        let point = arena
            .child_tagged(node, TAG_PUBLIC_POINT)
            .map(|n| Bytes::copy_from_slice(arena.value(n)));
        Ok(Self {
            protocol,
            point,
            raw: arena.serialize(node),
        })
    }

    /// The signature or key-agreement protocol this key is for
    pub fn protocol(&self) -> &Oid {
        &self.protocol
    }

    /// The public point (tag `86`), uncompressed, when present
    pub fn point(&self) -> Option<&[u8]> {
        self.point.as_deref()
    }

    /// The full `7F49` template for re-transmission
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// A parsed card-verifiable certificate
#[derive(Clone, Debug)]
pub struct CardVerifiableCertificate {
    raw: Bytes,
    content: Bytes,
    profile_identifier: u8,
    car: PublicKeyReference,
    chr: PublicKeyReference,
    public_key: CvcPublicKey,
    chat: Chat,
    effective_date: CvcDate,
    expiration_date: CvcDate,
    extensions: Option<Bytes>,
}

impl CardVerifiableCertificate {
    /// Parse a `7F21` certificate template, requiring every mandatory body
    /// element
    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self> {
        let arena = TlvArena::parse(bytes)?;
        let root = arena
            .root_tagged(Tag::CV_CERTIFICATE)
            .ok_or(Error::CertificateFormat("expected a CV certificate"))?;
        let body = arena
            .child_tagged(root, Tag::CERTIFICATE_BODY)
            .ok_or(Error::CertificateFormat("certificate without body"))?;
        arena
            .child_tagged(root, TAG_SIGNATURE)
            .ok_or(Error::CertificateFormat("certificate without signature"))?;

        let mut profile_identifier = None;
        let mut car = None;
        let mut chr = None;
        let mut public_key = None;
        let mut chat = None;
        let mut effective_date = None;
        let mut expiration_date = None;
        let mut extensions = None;

        for child in arena.children(body) {
            match arena.tag(child).encoded() {
                TAG_CPI => {
                    let value = arena.value(child);
                    if value.len() != 1 {
                        return Err(Error::CertificateFormat("profile identifier length"));
                    }
                    profile_identifier = Some(value[0]);
                }
                TAG_CAR => car = Some(PublicKeyReference::parse(arena.value(child))?),
                TAG_CHR => chr = Some(PublicKeyReference::parse(arena.value(child))?),
                TAG_PUBLIC_KEY => public_key = Some(CvcPublicKey::from_node(&arena, child)?),
                TAG_CHAT => chat = Some(Chat::from_node(&arena, child)?),
                TAG_EFFECTIVE_DATE => effective_date = Some(CvcDate::parse(arena.value(child))?),
                TAG_EXPIRATION_DATE => expiration_date = Some(CvcDate::parse(arena.value(child))?),
                TAG_EXTENSIONS => extensions = Some(arena.serialize(child)),
                // Unknown body elements are tolerated for forward
                // compatibility.
                _ => {}
            }
        }

        let root_value = Bytes::copy_from_slice(arena.value(root));
        Ok(Self {
            raw: arena.serialize(root),
            content: root_value,
            profile_identifier: profile_identifier
                .ok_or(Error::CertificateFormat("missing profile identifier"))?,
            car: car.ok_or(Error::CertificateFormat("missing authority reference"))?,
            chr: chr.ok_or(Error::CertificateFormat("missing holder reference"))?,
            public_key: public_key.ok_or(Error::CertificateFormat("missing public key"))?,
            chat: chat.ok_or(Error::CertificateFormat("missing authorization template"))?,
            effective_date: effective_date
                .ok_or(Error::CertificateFormat("missing effective date"))?,
            expiration_date: expiration_date
                .ok_or(Error::CertificateFormat("missing expiration date"))?,
            extensions,
        })
    }

    /// The complete certificate as received
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Body and signature templates back to back, the payload installed via
    /// PSO:Verify Certificate
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Certificate profile identifier (CPI)
    pub const fn profile_identifier(&self) -> u8 {
        self.profile_identifier
    }

    /// Certification authority reference (issuer)
    pub fn car(&self) -> &PublicKeyReference {
        &self.car
    }

    /// Certificate holder reference (subject)
    pub fn chr(&self) -> &PublicKeyReference {
        &self.chr
    }

    /// The subject public key
    pub fn public_key(&self) -> &CvcPublicKey {
        &self.public_key
    }

    /// The holder authorization template
    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    /// First day of validity
    pub const fn effective_date(&self) -> CvcDate {
        self.effective_date
    }

    /// Last day of validity
    pub const fn expiration_date(&self) -> CvcDate {
        self.expiration_date
    }

    /// Certificate extensions template (`65`), when present
    pub fn extensions(&self) -> Option<&[u8]> {
        self.extensions.as_deref()
    }

    /// The description document hash from the id-description extension,
    /// when the certificate carries one.
    ///
    /// Terminal certificates bind the human-readable service description to
    /// the certificate through this hash; callers compare it against the
    /// digest of the description they were handed before showing it.
    pub fn description_hash(&self) -> Result<Option<Bytes>> {
        let Some(extensions) = &self.extensions else {
            return Ok(None);
        };
        let arena = TlvArena::parse(extensions.clone())?;
        let root = arena
            .root_tagged(TAG_EXTENSIONS)
            .ok_or(Error::CertificateFormat("malformed extensions template"))?;
        for template in arena.children(root) {
            if arena.tag(template).encoded() != TAG_DISCRETIONARY_DATA {
                continue;
            }
            let Some(oid_node) = arena.child_tagged(template, TAG_OID) else {
                continue;
            };
            if arena.value(oid_node) != Oid::EXTENSION_DESCRIPTION.encoded() {
                continue;
            }
            let hash = arena
                .child_tagged(template, TAG_CONTEXT_0)
                .ok_or(Error::CertificateFormat("description extension without hash"))?;
            return Ok(Some(Bytes::copy_from_slice(arena.value(hash))));
        }
        Ok(None)
    }

    /// Whether issuer and holder references are the same (CVCA root or link
    /// certificate anchor)
    pub fn is_self_signed(&self) -> bool {
        self.car == self.chr
    }

    /// Whether `date` falls inside the validity period, bounds included
    pub fn is_valid_at(&self, date: CvcDate) -> bool {
        self.effective_date <= date && date <= self.expiration_date
    }
}

impl PartialEq for CardVerifiableCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CardVerifiableCertificate {}
