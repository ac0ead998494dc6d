//! SELECT (INS 0xA4)

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, Response};

use super::{CLA_PLAIN, unexpected_status};
use crate::error::Error;

const INS_SELECT: u8 = 0xA4;

/// SELECT choosing the master file, an elementary file or an application.
///
/// P2 requests no FCI in the response, so success carries no payload.
#[derive(Debug, Clone)]
pub struct Select {
    p1: u8,
    data: Bytes,
}

impl Select {
    /// Select the master file (0x3F00)
    pub fn master_file() -> Self {
        Self {
            p1: 0x00,
            data: Bytes::from_static(&[0x3F, 0x00]),
        }
    }

    /// Select an elementary file below the current DF by its identifier
    pub fn elementary_file(fid: u16) -> Self {
        Self {
            p1: 0x02,
            data: Bytes::copy_from_slice(&fid.to_be_bytes()),
        }
    }

    /// Select an application by its AID
    pub fn application(aid: impl Into<Bytes>) -> Self {
        Self {
            p1: 0x04,
            data: aid.into(),
        }
    }
}

impl ApduCommand for Select {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new_with_data(CLA_PLAIN, INS_SELECT, self.p1, 0x0C, self.data.clone())
    }

    fn parse_response(response: Response) -> Result<(), Error> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_file_deactivated() {
            Err(Error::CardDeactivated)
        } else {
            Err(unexpected_status(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use perso_apdu_core::response::status::common;

    use super::*;

    #[test]
    fn test_select_master_file() {
        let bytes = Select::master_file().to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00A4000C023F00"));
    }

    #[test]
    fn test_select_elementary_file() {
        let bytes = Select::elementary_file(crate::commands::EF_CARD_ACCESS)
            .to_command()
            .to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00A4020C02011C"));
    }

    #[test]
    fn test_select_application() {
        // AID of the eID application.
        let bytes = Select::application(hex!("E80704007F00070302").to_vec())
            .to_command()
            .to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00A4040C09E80704007F00070302"));
    }

    #[test]
    fn test_deactivated_file() {
        let response = Response::status_only(common::FILE_DEACTIVATED);
        assert!(matches!(
            Select::parse_response(response),
            Err(Error::CardDeactivated)
        ));

        let not_found = Response::status_only(common::FILE_NOT_FOUND);
        assert!(matches!(
            Select::parse_response(not_found),
            Err(Error::DispatchFailure(_))
        ));
    }
}
