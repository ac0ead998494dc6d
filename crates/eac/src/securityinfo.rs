//! SecurityInfo structures from EF.CardAccess and EF.CardSecurity
//!
//! Both files carry a `SET OF SecurityInfo`, each a SEQUENCE opening with a
//! protocol OID. The variants are told apart by that OID's family plus the
//! shape of the second element (INTEGER version vs. AlgorithmIdentifier),
//! so new info types a card may ship do not break parsing: anything
//! unrecognized is preserved as [`SecurityInfo::Unknown`].

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::tlv::{NodeId, Tag, TlvArena, TlvReader};

const TAG_SET: u32 = 0x31;
const TAG_SEQUENCE: u32 = 0x30;
const TAG_OID: u32 = 0x06;
const TAG_INTEGER: u32 = 0x02;
const TAG_BIT_STRING: u32 = 0x03;
const TAG_OCTET_STRING: u32 = 0x04;
const TAG_IA5_STRING: u32 = 0x16;

/// One entry of the security info set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityInfo {
    /// PACEInfo: a concrete PACE cipher suite the card offers
    Pace(PaceInfo),
    /// PACEDomainParameterInfo: domain parameters for a PACE mapping family
    PaceDomainParameter(PaceDomainParameterInfo),
    /// ChipAuthenticationInfo: a concrete chip authentication suite
    ChipAuthentication(ChipAuthenticationInfo),
    /// ChipAuthenticationDomainParameterInfo
    ChipAuthenticationDomainParameter(ChipAuthenticationDomainParameterInfo),
    /// ChipAuthenticationPublicKeyInfo: the chip's static key (EF.CardSecurity)
    ChipAuthenticationPublicKey(ChipAuthenticationPublicKeyInfo),
    /// TerminalAuthenticationInfo
    TerminalAuthentication(TerminalAuthenticationInfo),
    /// CardInfoLocator: where the matching CardInfo file can be fetched
    CardInfo(CardInfoLocator),
    /// Any info this implementation does not interpret, kept verbatim
    Unknown {
        /// Protocol OID of the entry
        protocol: Oid,
        /// Complete DER encoding of the entry
        raw: Bytes,
    },
}

/// PACEInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceInfo {
    /// Cipher suite identifier below id-PACE
    pub protocol: Oid,
    /// Protocol version; only 2 is deployed
    pub version: i32,
    /// Standardized domain parameter index
    pub parameter_id: Option<i32>,
}

/// PACEDomainParameterInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceDomainParameterInfo {
    /// Mapping family identifier (e.g. id-PACE-ECDH-GM)
    pub protocol: Oid,
    /// The referenced domain parameters
    pub domain_parameter: DomainParameters,
    /// Present when the card holds several parameter sets
    pub parameter_id: Option<i32>,
}

/// ChipAuthenticationInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationInfo {
    /// Cipher suite identifier below id-CA
    pub protocol: Oid,
    /// Protocol version (1, 2 or 3)
    pub version: i32,
    /// Identifies the chip key when several exist
    pub key_id: Option<i32>,
}

/// ChipAuthenticationDomainParameterInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationDomainParameterInfo {
    /// Key agreement family identifier (e.g. id-CA-ECDH)
    pub protocol: Oid,
    /// The referenced domain parameters
    pub domain_parameter: DomainParameters,
    /// Identifies the chip key when several exist
    pub key_id: Option<i32>,
}

/// ChipAuthenticationPublicKeyInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationPublicKeyInfo {
    /// id-PK family identifier
    pub protocol: Oid,
    /// Algorithm of the embedded SubjectPublicKeyInfo
    pub algorithm: Oid,
    /// Raw algorithm parameters (standardized index or explicit curve)
    pub algorithm_parameters: Bytes,
    /// Content of the subjectPublicKey BIT STRING, unused-bits octet stripped
    pub public_key: Bytes,
    /// Identifies the chip key when several exist
    pub key_id: Option<i32>,
}

/// TerminalAuthenticationInfo per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAuthenticationInfo {
    /// id-TA or a concrete signature suite below it
    pub protocol: Oid,
    /// Protocol version
    pub version: i32,
}

/// CardInfoLocator per TR-03110 part 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfoLocator {
    /// id-CI
    pub protocol: Oid,
    /// URL of the CardInfo file (IA5String)
    pub url: String,
    /// On-card copy of the CardInfo file, when one exists
    pub ef_card_info: Option<FileReference>,
}

/// A file identifier with an optional short file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReference {
    /// Two-byte file identifier
    pub fid: u16,
    /// Short file identifier for implicit selection
    pub sfid: Option<u8>,
}

/// Domain parameters referenced from an AlgorithmIdentifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainParameters {
    /// standardizedDomainParameters with a TR-03110 table index
    Standardized(i32),
    /// Explicitly spelled-out parameters, not interpreted here
    Explicit {
        /// Algorithm OID of the identifier
        algorithm: Oid,
        /// Raw parameter encoding
        raw: Bytes,
    },
}

/// The parsed security info set of a card file
#[derive(Debug, Clone)]
pub struct SecurityInfos {
    infos: Vec<SecurityInfo>,
    raw: Bytes,
}

impl SecurityInfos {
    /// Parse the content of EF.CardAccess or EF.CardSecurity
    pub fn parse(input: impl Into<Bytes>) -> Result<Self> {
        let raw = input.into();
        let arena = TlvArena::parse(raw.clone())?;
        let set = arena
            .root_tagged(TAG_SET)
            .ok_or(Error::MalformedEncoding("security info set missing"))?;

        let mut infos = Vec::new();
        for entry in arena.children(set) {
            if arena.tag(entry) != Tag::new(TAG_SEQUENCE) {
                return Err(Error::MalformedEncoding("security info is not a sequence"));
            }
            infos.push(parse_entry(&arena, entry)?);
        }
        Ok(Self { infos, raw })
    }

    /// All parsed entries
    pub fn iter(&self) -> impl Iterator<Item = &SecurityInfo> {
        self.infos.iter()
    }

    /// The PACE cipher suites the card offers
    pub fn pace_infos(&self) -> impl Iterator<Item = &PaceInfo> {
        self.infos.iter().filter_map(|info| match info {
            SecurityInfo::Pace(pace) => Some(pace),
            _ => None,
        })
    }

    /// Domain parameter entries for PACE
    pub fn pace_domain_parameter_infos(&self) -> impl Iterator<Item = &PaceDomainParameterInfo> {
        self.infos.iter().filter_map(|info| match info {
            SecurityInfo::PaceDomainParameter(dp) => Some(dp),
            _ => None,
        })
    }

    /// The chip authentication suites the card offers
    pub fn chip_authentication_infos(&self) -> impl Iterator<Item = &ChipAuthenticationInfo> {
        self.infos.iter().filter_map(|info| match info {
            SecurityInfo::ChipAuthentication(ca) => Some(ca),
            _ => None,
        })
    }

    /// Domain parameter entries for chip authentication
    pub fn chip_authentication_domain_parameter_infos(
        &self,
    ) -> impl Iterator<Item = &ChipAuthenticationDomainParameterInfo> {
        self.infos.iter().filter_map(|info| match info {
            SecurityInfo::ChipAuthenticationDomainParameter(dp) => Some(dp),
            _ => None,
        })
    }

    /// Static chip keys (present in EF.CardSecurity)
    pub fn chip_authentication_public_key_infos(
        &self,
    ) -> impl Iterator<Item = &ChipAuthenticationPublicKeyInfo> {
        self.infos.iter().filter_map(|info| match info {
            SecurityInfo::ChipAuthenticationPublicKey(pk) => Some(pk),
            _ => None,
        })
    }

    /// The terminal authentication announcement, if present
    pub fn terminal_authentication_info(&self) -> Option<&TerminalAuthenticationInfo> {
        self.infos.iter().find_map(|info| match info {
            SecurityInfo::TerminalAuthentication(ta) => Some(ta),
            _ => None,
        })
    }

    /// The CardInfo locator, if present
    pub fn card_info_locator(&self) -> Option<&CardInfoLocator> {
        self.infos.iter().find_map(|info| match info {
            SecurityInfo::CardInfo(ci) => Some(ci),
            _ => None,
        })
    }

    /// The file content these infos were parsed from
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

fn parse_entry(arena: &TlvArena, entry: NodeId) -> Result<SecurityInfo> {
    let mut reader = arena.reader(entry);
    let oid_node = reader.expect(TAG_OID, "security info missing protocol oid")?;
    let protocol = Oid::from_encoded(Bytes::copy_from_slice(arena.value(oid_node)))?;

    // The second element separates version-carrying infos (INTEGER) from
    // domain parameter infos (AlgorithmIdentifier SEQUENCE).
    let versioned = reader.matches(TAG_INTEGER);

    let info = if protocol.starts_with(&Oid::PACE) {
        if versioned {
            let version = read_integer(arena, &mut reader, "pace version")?;
            let parameter_id = read_optional_integer(arena, &mut reader)?;
            SecurityInfo::Pace(PaceInfo {
                protocol,
                version,
                parameter_id,
            })
        } else {
            let domain_parameter = read_algorithm_identifier(arena, &mut reader)?;
            let parameter_id = read_optional_integer(arena, &mut reader)?;
            SecurityInfo::PaceDomainParameter(PaceDomainParameterInfo {
                protocol,
                domain_parameter,
                parameter_id,
            })
        }
    } else if protocol.starts_with(&Oid::CA) {
        if versioned {
            let version = read_integer(arena, &mut reader, "chip authentication version")?;
            let key_id = read_optional_integer(arena, &mut reader)?;
            SecurityInfo::ChipAuthentication(ChipAuthenticationInfo {
                protocol,
                version,
                key_id,
            })
        } else {
            let domain_parameter = read_algorithm_identifier(arena, &mut reader)?;
            let key_id = read_optional_integer(arena, &mut reader)?;
            SecurityInfo::ChipAuthenticationDomainParameter(ChipAuthenticationDomainParameterInfo {
                protocol,
                domain_parameter,
                key_id,
            })
        }
    } else if protocol.starts_with(&Oid::TA) && versioned {
        let version = read_integer(arena, &mut reader, "terminal authentication version")?;
        SecurityInfo::TerminalAuthentication(TerminalAuthenticationInfo { protocol, version })
    } else if protocol == Oid::CARD_INFO {
        parse_card_info(arena, &mut reader, protocol)?
    } else if protocol.starts_with(&Oid::PK_ECDH) {
        parse_public_key_info(arena, &mut reader, protocol)?
    } else {
        SecurityInfo::Unknown {
            protocol,
            raw: arena.serialize(entry),
        }
    };
    Ok(info)
}

fn parse_public_key_info(
    arena: &TlvArena,
    reader: &mut TlvReader<'_>,
    protocol: Oid,
) -> Result<SecurityInfo> {
    let spki = reader.expect(TAG_SEQUENCE, "public key info missing key")?;
    let mut spki_reader = arena.reader(spki);
    let alg_id = spki_reader.expect(TAG_SEQUENCE, "subject public key missing algorithm")?;

    let mut alg_reader = arena.reader(alg_id);
    let alg_oid = alg_reader.expect(TAG_OID, "algorithm identifier missing oid")?;
    let algorithm = Oid::from_encoded(Bytes::copy_from_slice(arena.value(alg_oid)))?;
    let algorithm_parameters = alg_reader
        .advance()
        .map_or_else(Bytes::new, |params| arena.serialize(params));

    let bit_string = spki_reader.expect(TAG_BIT_STRING, "subject public key missing bit string")?;
    let key_bytes = arena.value(bit_string);
    let public_key = match key_bytes.split_first() {
        Some((0x00, content)) => Bytes::copy_from_slice(content),
        _ => return Err(Error::MalformedEncoding("public key has unused bits")),
    };

    let key_id = read_optional_integer(arena, reader)?;
    Ok(SecurityInfo::ChipAuthenticationPublicKey(
        ChipAuthenticationPublicKeyInfo {
            protocol,
            algorithm,
            algorithm_parameters,
            public_key,
            key_id,
        },
    ))
}

fn parse_card_info(
    arena: &TlvArena,
    reader: &mut TlvReader<'_>,
    protocol: Oid,
) -> Result<SecurityInfo> {
    let url_node = reader.expect(TAG_IA5_STRING, "card info locator missing url")?;
    let url = String::from_utf8(arena.value(url_node).to_vec())
        .ok()
        .filter(|url| url.is_ascii())
        .ok_or(Error::MalformedEncoding("card info url is not ascii"))?;

    let ef_card_info = match reader.accept(TAG_SEQUENCE) {
        Some(file_id) => {
            let mut file_reader = arena.reader(file_id);
            let fid_node = file_reader.expect(TAG_OCTET_STRING, "file reference missing fid")?;
            let fid = match *arena.value(fid_node) {
                [hi, lo] => u16::from_be_bytes([hi, lo]),
                _ => return Err(Error::MalformedEncoding("file identifier is not two bytes")),
            };
            let sfid = file_reader
                .accept(TAG_OCTET_STRING)
                .map(|node| match *arena.value(node) {
                    [sfid] => Ok(sfid),
                    _ => Err(Error::MalformedEncoding("short file identifier is not one byte")),
                })
                .transpose()?;
            Some(FileReference { fid, sfid })
        }
        None => None,
    };

    Ok(SecurityInfo::CardInfo(CardInfoLocator {
        protocol,
        url,
        ef_card_info,
    }))
}

fn read_algorithm_identifier(
    arena: &TlvArena,
    reader: &mut TlvReader<'_>,
) -> Result<DomainParameters> {
    let alg_id = reader.expect(TAG_SEQUENCE, "missing algorithm identifier")?;
    let mut alg_reader = arena.reader(alg_id);
    let oid_node = alg_reader.expect(TAG_OID, "algorithm identifier missing oid")?;
    let algorithm = Oid::from_encoded(Bytes::copy_from_slice(arena.value(oid_node)))?;

    if algorithm == Oid::STANDARDIZED_DOMAIN_PARAMETERS {
        let index = read_integer(arena, &mut alg_reader, "domain parameter index")?;
        Ok(DomainParameters::Standardized(index))
    } else {
        let raw = alg_reader
            .advance()
            .map_or_else(Bytes::new, |params| arena.serialize(params));
        Ok(DomainParameters::Explicit { algorithm, raw })
    }
}

fn read_integer(
    arena: &TlvArena,
    reader: &mut TlvReader<'_>,
    what: &'static str,
) -> Result<i32> {
    let node = reader.expect(TAG_INTEGER, what)?;
    decode_integer(arena.value(node))
}

fn read_optional_integer(
    arena: &TlvArena,
    reader: &mut TlvReader<'_>,
) -> Result<Option<i32>> {
    reader
        .accept(TAG_INTEGER)
        .map(|node| decode_integer(arena.value(node)))
        .transpose()
}

/// Decode a DER INTEGER content into an i32
pub(crate) fn decode_integer(content: &[u8]) -> Result<i32> {
    let (&first, rest) = content
        .split_first()
        .ok_or(Error::MalformedEncoding("empty integer"))?;
    if content.len() > 4 {
        return Err(Error::MalformedEncoding("integer too large"));
    }
    let mut value = i32::from(first as i8);
    for &byte in rest {
        value = (value << 8) | i32::from(byte);
    }
    Ok(value)
}
