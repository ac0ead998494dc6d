//! READ BINARY (INS 0xB0)

use bytes::Bytes;
use perso_apdu_core::{ApduCommand, Command, ExpectedLength, Response};

use super::CLA_PLAIN;
use crate::error::Error;

const INS_READ_BINARY: u8 = 0xB0;

/// READ BINARY from a transparent file
#[derive(Debug, Clone, Copy)]
pub struct ReadBinary {
    p1: u8,
    p2: u8,
    le: ExpectedLength,
}

impl ReadBinary {
    /// Read up to `le` bytes of the selected file starting at `offset`
    /// (`le` 0 requests as much as one response can carry)
    pub const fn at_offset(offset: u16, le: ExpectedLength) -> Self {
        // b8 of P1 must stay clear, it would turn the offset into an SFI.
        debug_assert!(offset < 0x8000);
        Self {
            p1: (offset >> 8) as u8,
            p2: (offset & 0xFF) as u8,
            le,
        }
    }

    /// Read from a file selected implicitly by short file identifier
    pub const fn with_short_file_id(sfid: u8, offset: u8, le: ExpectedLength) -> Self {
        debug_assert!(sfid <= 0x1F);
        Self {
            p1: 0x80 | sfid,
            p2: offset,
            le,
        }
    }
}

impl ApduCommand for ReadBinary {
    type Success = Bytes;
    type Error = Error;

    fn to_command(&self) -> Command {
        Command::new(CLA_PLAIN, INS_READ_BINARY, self.p1, self.p2).with_le(self.le)
    }

    fn parse_response(response: Response) -> Result<Bytes, Error> {
        match response.status().to_u16() {
            // End of file reached inside the requested window; the bytes
            // read so far still count.
            0x6282 => Ok(response.payload().clone()),
            // Offset starts past the end of file, the read loop is done.
            0x6B00 => Ok(Bytes::new()),
            _ => response.into_payload().map_err(Error::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_offset_encoding() {
        let bytes = ReadBinary::at_offset(0, 0).to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00B0000000"));

        let bytes = ReadBinary::at_offset(0x01A4, 0xE0).to_command().to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00B001A4E0"));
    }

    #[test]
    fn test_short_file_id() {
        let bytes = ReadBinary::with_short_file_id(0x1C, 0, 0)
            .to_command()
            .to_bytes();
        assert_eq!(bytes.as_ref(), &hex!("00B09C0000"));
    }

    #[test]
    fn test_end_of_file_handling() {
        let partial = Response::new(hex!("31 03 0201FF").to_vec(), (0x62, 0x82));
        assert_eq!(
            ReadBinary::parse_response(partial).unwrap().as_ref(),
            &hex!("31030201FF")
        );

        let beyond = Response::status_only((0x6B, 0x00));
        assert!(ReadBinary::parse_response(beyond).unwrap().is_empty());

        let denied = Response::status_only((0x69, 0x82));
        assert!(matches!(
            ReadBinary::parse_response(denied),
            Err(Error::DispatchFailure(_))
        ));
    }
}
