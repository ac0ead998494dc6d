//! GET CHALLENGE (INS 0x84)

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response};

use super::CLA_PLAIN;
use crate::error::{Error, Result};

const INS_GET_CHALLENGE: u8 = 0x84;
const CHALLENGE_LEN: usize = 8;

/// GET CHALLENGE requesting the eight card bytes the terminal
/// authentication signature covers
#[derive(Debug, Clone, Copy, Default)]
pub struct GetChallenge;

impl ApduCommand for GetChallenge {
    type Success = Bytes;
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new(CLA_PLAIN, INS_GET_CHALLENGE, 0x00, 0x00).with_le(CHALLENGE_LEN as u16)
    }

    fn parse_response(response: Response) -> Result<Bytes> {
        let challenge = response.into_payload().map_err(Error::from)?;
        if challenge.len() == CHALLENGE_LEN {
            Ok(challenge)
        } else {
            Err(Error::MalformedEncoding("challenge is not eight bytes"))
        }
    }
}
