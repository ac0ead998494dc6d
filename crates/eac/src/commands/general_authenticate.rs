//! GENERAL AUTHENTICATE (INS 0x86)
//!
//! Every PACE round and the chip authentication round ride on this
//! instruction. Command and response both wrap their payload in a 0x7C
//! dynamic authentication template; all rounds of a multi-round exchange
//! except the last set the command chaining class bit.

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response};

use super::CLA_PLAIN;
use crate::error::{Error, Result};
use crate::tlv::{NodeId, Tag, TlvArena, TlvWriter};

const INS_GENERAL_AUTHENTICATE: u8 = 0x86;

/// One General Authenticate round
#[derive(Debug, Clone)]
pub struct GeneralAuthenticate {
    data: Bytes,
    last: bool,
}

impl GeneralAuthenticate {
    /// First PACE round: ask for the encrypted nonce (empty template)
    pub fn request_nonce() -> Self {
        Self {
            data: crate::tlv::encode(Tag::DYNAMIC_AUTHENTICATION_DATA, &[]),
            last: false,
        }
    }

    /// Second PACE round: send the terminal's mapping key (tag 0x81)
    pub fn map_nonce(mapping_data: &[u8]) -> Self {
        Self::round(0x81, mapping_data, false)
    }

    /// Third PACE round: send the terminal's ephemeral key (tag 0x83)
    pub fn key_agreement(ephemeral_key: &[u8]) -> Self {
        Self::round(0x83, ephemeral_key, false)
    }

    /// Final PACE round: send the terminal's authentication token (tag 0x85)
    pub fn mutual_authentication(token: &[u8]) -> Self {
        Self::round(0x85, token, true)
    }

    /// Chip authentication round with the ephemeral key announced during
    /// terminal authentication (tag 0x80)
    pub fn chip_authentication(ephemeral_key: &[u8]) -> Self {
        Self::round(0x80, ephemeral_key, true)
    }

    fn round(tag: u32, content: &[u8], last: bool) -> Self {
        let mut writer = TlvWriter::new();
        writer.constructed(Tag::DYNAMIC_AUTHENTICATION_DATA, |w| {
            w.primitive(tag, content);
        });
        Self {
            data: writer.into_bytes(),
            last,
        }
    }
}

impl ApduCommand for GeneralAuthenticate {
    type Success = DynamicAuthenticationData;
    type Error = Error;

    fn to_command(&self) -> Command {
        let command = Command::new_with_data(
            CLA_PLAIN,
            INS_GENERAL_AUTHENTICATE,
            0x00,
            0x00,
            self.data.clone(),
        )
        .with_le(0);
        if self.last {
            command
        } else {
            command.with_chaining()
        }
    }

    fn parse_response(response: Response) -> Result<DynamicAuthenticationData> {
        let status = response.status();
        if let Some(counter) = status.retry_counter() {
            // Wrong password: the card answers the final round with the
            // decremented retry counter (German eID profile).
            return Err(match counter {
                0 => Error::PasswordBlocked,
                1 => Error::PasswordSuspended,
                tries => Error::WrongPasswordRetryCounter(tries),
            });
        }
        if status.to_u16() == 0x6300 {
            return Err(Error::AuthenticationTokenMismatch);
        }
        DynamicAuthenticationData::parse(response.into_payload().map_err(Error::from)?)
    }
}

/// The parsed 0x7C template of a General Authenticate response.
///
/// Field tags are context specific per round (0x80 carries the encrypted
/// nonce in PACE but the nonce in chip authentication), so the protocol
/// steps address fields by the tag their round defines.
#[derive(Debug, Clone)]
pub struct DynamicAuthenticationData {
    arena: TlvArena,
    root: NodeId,
}

impl DynamicAuthenticationData {
    /// Parse a response payload
    pub fn parse(payload: Bytes) -> Result<Self> {
        let arena = TlvArena::parse(payload)?;
        let root = arena.root_tagged(Tag::DYNAMIC_AUTHENTICATION_DATA).ok_or(
            Error::MalformedEncoding("expected a dynamic authentication template"),
        )?;
        Ok(Self { arena, root })
    }

    /// Value of the context tag `tag`, when present
    pub fn field(&self, tag: u32) -> Option<&[u8]> {
        self.arena
            .child_tagged(self.root, tag)
            .map(|node| self.arena.value(node))
    }

    /// Value of the context tag `tag`, required
    pub fn require(&self, tag: u32, missing: &'static str) -> Result<&[u8]> {
        self.field(tag).ok_or(Error::MalformedEncoding(missing))
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_request_nonce_wire_format() {
        let bytes = GeneralAuthenticate::request_nonce().to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("10860000 02 7C00 00"));
    }

    #[test]
    fn test_final_round_unchained() {
        let token = hex!("AE73F376F0E02ED2");
        let bytes = GeneralAuthenticate::mutual_authentication(&token)
            .to_command()
            .to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00860000 0C 7C0A 8508 AE73F376F0E02ED2 00"));
    }

    #[test]
    fn test_intermediate_rounds_chained() {
        for command in [
            GeneralAuthenticate::map_nonce(&[0x04; 65]),
            GeneralAuthenticate::key_agreement(&[0x04; 65]),
        ] {
            assert_eq!(command.to_command().class(), 0x10);
        }
        let ca = GeneralAuthenticate::chip_authentication(&[0x04; 65]);
        assert_eq!(ca.to_command().class(), 0x00);
    }

    #[test]
    fn test_response_fields() {
        let payload = hex!("7C 0E 81 04 DEADBEEF 82 02 AABB 87 02 CCDD");
        let response = Response::success(payload.to_vec());
        let data = GeneralAuthenticate::parse_response(response).unwrap();
        assert_eq!(data.field(0x81), Some(&hex!("DEADBEEF")[..]));
        assert_eq!(data.field(0x82), Some(&hex!("AABB")[..]));
        assert_eq!(data.field(0x87), Some(&hex!("CCDD")[..]));
        assert_eq!(data.field(0x88), None);
        assert!(data.require(0x88, "previous car missing").is_err());
    }

    #[test]
    fn test_wrong_password_grading() {
        let parse = |sw1, sw2| GeneralAuthenticate::parse_response(Response::status_only((sw1, sw2)));
        assert!(matches!(
            parse(0x63, 0xC2),
            Err(Error::WrongPasswordRetryCounter(2))
        ));
        assert!(matches!(parse(0x63, 0xC1), Err(Error::PasswordSuspended)));
        assert!(matches!(parse(0x63, 0xC0), Err(Error::PasswordBlocked)));
        assert!(matches!(
            parse(0x63, 0x00),
            Err(Error::AuthenticationTokenMismatch)
        ));
        assert!(matches!(parse(0x69, 0x82), Err(Error::DispatchFailure(_))));
    }

    #[test]
    fn test_missing_template_rejected() {
        let response = Response::success(hex!("8104DEADBEEF").to_vec());
        assert!(matches!(
            GeneralAuthenticate::parse_response(response),
            Err(Error::MalformedEncoding(_))
        ));
    }
}
