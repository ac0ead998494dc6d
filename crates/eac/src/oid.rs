//! Object identifiers for the TR-03110 protocol families
//!
//! Protocol negotiation matches OIDs both exactly (a cipher-suite leaf such
//! as `id-PACE-ECDH-GM-AES-CBC-CMAC-128`) and by family prefix (everything
//! below `id-PACE`). [`Oid`] therefore keeps the DER content octets and
//! offers prefix tests over them, while arcs are decoded on demand with full
//! base-128 handling for multi-byte arc numbers.

use core::fmt;
use core::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// An ASN.1 object identifier, held as DER content octets
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid(Bytes);

impl Oid {
    /// bsi-de: 0.4.0.127.0.7
    pub const BSI_DE: Self = Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07]);

    /// standardizedDomainParameters: bsi-de 1.2
    pub const STANDARDIZED_DOMAIN_PARAMETERS: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x01, 0x02]);

    /// id-PACE: bsi-de 2.2.4
    pub const PACE: Self = Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04]);
    /// id-PACE-ECDH-GM: generic mapping over ECDH
    pub const PACE_ECDH_GM: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02]);
    /// id-PACE-ECDH-GM-AES-CBC-CMAC-128
    pub const PACE_ECDH_GM_AES_CBC_CMAC_128: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02]);
    /// id-PACE-ECDH-GM-AES-CBC-CMAC-192
    pub const PACE_ECDH_GM_AES_CBC_CMAC_192: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x03]);
    /// id-PACE-ECDH-GM-AES-CBC-CMAC-256
    pub const PACE_ECDH_GM_AES_CBC_CMAC_256: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x04]);

    /// id-TA: bsi-de 2.2.2
    pub const TA: Self = Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02]);
    /// id-TA-ECDSA-SHA-256
    pub const TA_ECDSA_SHA_256: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02, 0x02, 0x03]);
    /// id-TA-ECDSA-SHA-384
    pub const TA_ECDSA_SHA_384: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02, 0x02, 0x04]);
    /// id-TA-ECDSA-SHA-512
    pub const TA_ECDSA_SHA_512: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02, 0x02, 0x05]);

    /// id-CA: bsi-de 2.2.3
    pub const CA: Self = Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03]);
    /// id-CA-ECDH
    pub const CA_ECDH: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03, 0x02]);
    /// id-CA-ECDH-AES-CBC-CMAC-128
    pub const CA_ECDH_AES_CBC_CMAC_128: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03, 0x02, 0x02]);
    /// id-CA-ECDH-AES-CBC-CMAC-192
    pub const CA_ECDH_AES_CBC_CMAC_192: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03, 0x02, 0x03]);
    /// id-CA-ECDH-AES-CBC-CMAC-256
    pub const CA_ECDH_AES_CBC_CMAC_256: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03, 0x02, 0x04]);

    /// id-PK-ECDH (chip authentication public key)
    pub const PK_ECDH: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x01, 0x02]);

    /// id-CI: bsi-de 2.2.6, the CardInfoLocator entry
    pub const CARD_INFO: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x06]);

    /// id-IS: inspection system terminal type
    pub const TERMINAL_TYPE_IS: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x01]);
    /// id-AT: authentication terminal type
    pub const TERMINAL_TYPE_AT: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x02]);
    /// id-ST: signature terminal type
    pub const TERMINAL_TYPE_ST: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x03]);

    /// id-description: certificate extension naming the terminal
    /// description document by hash
    pub const EXTENSION_DESCRIPTION: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x01]);

    /// id-DateOfBirth: age verification auxiliary data
    pub const AUX_DATE_OF_BIRTH: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x04, 0x01]);
    /// id-DateOfExpiry: document validity auxiliary data
    pub const AUX_DATE_OF_EXPIRY: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x04, 0x02]);
    /// id-CommunityID: community ID auxiliary data
    pub const AUX_COMMUNITY_ID: Self =
        Self::from_static(&[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x04, 0x03]);

    /// Wrap static DER content octets
    pub const fn from_static(encoded: &'static [u8]) -> Self {
        Self(Bytes::from_static(encoded))
    }

    /// Take ownership of DER content octets, validating the arc structure
    pub fn from_encoded(encoded: impl Into<Bytes>) -> Result<Self> {
        let encoded = encoded.into();
        if encoded.is_empty() {
            return Err(Error::InvalidOid("empty encoding"));
        }
        // Every arc must terminate, and 0x80 must not lead one.
        let mut at_arc_start = true;
        for &byte in encoded.iter() {
            if at_arc_start && byte == 0x80 {
                return Err(Error::InvalidOid("non-minimal arc encoding"));
            }
            at_arc_start = byte & 0x80 == 0;
        }
        if !at_arc_start {
            return Err(Error::InvalidOid("truncated arc"));
        }
        Ok(Self(encoded))
    }

    /// The DER content octets
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// Decode the arc sequence
    pub fn arcs(&self) -> Arcs<'_> {
        Arcs {
            bytes: &self.0,
            pending_second: None,
            first_done: false,
        }
    }

    /// Whether this identifier lies below `family` (or equals it)
    pub fn starts_with(&self, family: &Self) -> bool {
        self.0.starts_with(&family.0)
    }

    /// Extend by one arc
    pub fn child(&self, arc: u32) -> Self {
        let mut out = BytesMut::with_capacity(self.0.len() + 5);
        out.put_slice(&self.0);
        write_arc(&mut out, arc);
        Self(out.freeze())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arc) in self.arcs().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match arc {
                Ok(arc) => write!(f, "{arc}")?,
                Err(_) => return f.write_str("<invalid>"),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({self})")
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut components = s.split('.').map(|part| {
            part.parse::<u32>()
                .map_err(|_| Error::InvalidOid("component is not a number"))
        });
        let first = components
            .next()
            .transpose()?
            .ok_or(Error::InvalidOid("empty string"))?;
        let second = components
            .next()
            .transpose()?
            .ok_or(Error::InvalidOid("fewer than two components"))?;
        if first > 2 || (first < 2 && second > 39) {
            return Err(Error::InvalidOid("root arcs out of range"));
        }

        let mut out = BytesMut::new();
        write_arc(&mut out, first * 40 + second);
        for component in components {
            write_arc(&mut out, component?);
        }
        Ok(Self(out.freeze()))
    }
}

/// Iterator over decoded arcs; yields an error on arc overflow
#[derive(Debug)]
pub struct Arcs<'a> {
    bytes: &'a [u8],
    pending_second: Option<u32>,
    first_done: bool,
}

impl Iterator for Arcs<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(second) = self.pending_second.take() {
            return Some(Ok(second));
        }
        if self.bytes.is_empty() {
            return None;
        }

        let mut value: u32 = 0;
        loop {
            let (&byte, rest) = self.bytes.split_first()?;
            self.bytes = rest;
            value = match value
                .checked_mul(128)
                .and_then(|v| v.checked_add((byte & 0x7F) as u32))
            {
                Some(v) => v,
                None => {
                    self.bytes = &[];
                    return Some(Err(Error::InvalidOid("arc exceeds 32 bits")));
                }
            };
            if byte & 0x80 == 0 {
                break;
            }
        }

        if self.first_done {
            return Some(Ok(value));
        }
        self.first_done = true;
        let (first, second) = match value {
            0..=39 => (0, value),
            40..=79 => (1, value - 40),
            _ => (2, value - 80),
        };
        self.pending_second = Some(second);
        Some(Ok(first))
    }
}

fn write_arc(out: &mut BytesMut, arc: u32) {
    let mut shifted = [0u8; 5];
    let mut len = 0;
    let mut value = arc;
    loop {
        shifted[len] = (value & 0x7F) as u8;
        value >>= 7;
        len += 1;
        if value == 0 {
            break;
        }
    }
    for i in (0..len).rev() {
        let continuation = if i == 0 { 0x00 } else { 0x80 };
        out.put_u8(shifted[i] | continuation);
    }
}
