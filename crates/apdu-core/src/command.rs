//! Command APDU definitions
//!
//! [`Command`] models an ISO 7816-4 command APDU (all four cases, short and
//! extended length). [`ApduCommand`] is the trait protocol layers implement
//! to pair a typed command with its typed response parsing.

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::response::Response;

/// Expected response length (Le). The value `0` requests the maximum the
/// chosen encoding can express (256 bytes short, 65536 bytes extended).
pub type ExpectedLength = u16;

/// An ISO 7816-4 command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<ExpectedLength>,
}

impl Command {
    /// Maximum data field length (extended encoding)
    pub const MAX_DATA_LEN: usize = 65_535;

    /// Command chaining bit in the class byte
    pub const CLA_CHAINING: u8 = 0x10;

    /// Create a new command with no data field and no Le
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with a data field
    pub fn new_with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Bytes>) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Set the data field
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        debug_assert!(data.len() <= Self::MAX_DATA_LEN);
        self.data = Some(data);
        self
    }

    /// Set the expected response length (0 = maximum)
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Set the command chaining bit in the class byte
    pub const fn with_chaining(mut self) -> Self {
        self.cla |= Self::CLA_CHAINING;
        self
    }

    /// Get the class byte
    pub const fn class(&self) -> u8 {
        self.cla
    }

    /// Get the instruction byte
    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    /// Get the P1 parameter
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Get the P2 parameter
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Get the data field, if any
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Get the expected response length, if any
    pub const fn expected_length(&self) -> Option<ExpectedLength> {
        self.le
    }

    /// Whether this command requires extended length encoding
    fn needs_extended(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.len() > 255)
            || self.le.is_some_and(|le| le > 256)
    }

    /// Serialize to raw APDU bytes.
    ///
    /// Short form is used whenever the data field fits in 255 bytes and Le in
    /// one byte; otherwise the whole APDU switches to extended form (a single
    /// APDU never mixes the two encodings).
    pub fn to_bytes(&self) -> Bytes {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        let mut buf = BytesMut::with_capacity(4 + 3 + data_len + 3);
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);

        let extended = self.needs_extended();

        if let Some(data) = &self.data {
            if extended {
                buf.put_u8(0x00);
                buf.put_u16(data.len() as u16);
            } else {
                buf.put_u8(data.len() as u8);
            }
            buf.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                // Without a data field the extended Le carries its own
                // leading zero marker.
                if self.data.is_none() {
                    buf.put_u8(0x00);
                }
                buf.put_u16(le);
            } else {
                buf.put_u8((le & 0xFF) as u8);
            }
        }

        buf.freeze()
    }

    /// Parse raw APDU bytes into a command (both encodings)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidCommandLength(bytes.len()));
        }
        let (cla, ins, p1, p2) = (bytes[0], bytes[1], bytes[2], bytes[3]);
        let rest = &bytes[4..];

        let mut command = Self::new(cla, ins, p1, p2);
        match rest.len() {
            // Case 1: header only
            0 => Ok(command),
            // Case 2 short: a single Le byte (0x00 = 256)
            1 => {
                let le = if rest[0] == 0 { 256 } else { rest[0] as u16 };
                Ok(command.with_le(le))
            }
            _ if rest[0] != 0 => {
                // Short form with data field
                let lc = rest[0] as usize;
                let body = &rest[1..];
                if body.len() == lc {
                    Ok(command.with_data(Bytes::copy_from_slice(body)))
                } else if body.len() == lc + 1 {
                    let le_byte = body[lc];
                    let le = if le_byte == 0 { 256 } else { le_byte as u16 };
                    Ok(command
                        .with_data(Bytes::copy_from_slice(&body[..lc]))
                        .with_le(le))
                } else {
                    Err(Error::InvalidCommandLength(bytes.len()))
                }
            }
            // Case 2 extended: 00 LeHi LeLo
            3 => Ok(command.with_le(u16::from_be_bytes([rest[1], rest[2]]))),
            _ => {
                // Extended form with data field
                if rest.len() < 3 {
                    return Err(Error::InvalidCommandLength(bytes.len()));
                }
                let lc = u16::from_be_bytes([rest[1], rest[2]]) as usize;
                let body = &rest[3..];
                if body.len() == lc {
                    Ok(command.with_data(Bytes::copy_from_slice(body)))
                } else if body.len() == lc + 2 {
                    let le = u16::from_be_bytes([body[lc], body[lc + 1]]);
                    command = command.with_data(Bytes::copy_from_slice(&body[..lc]));
                    Ok(command.with_le(le))
                } else {
                    Err(Error::InvalidCommandLength(bytes.len()))
                }
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X} {:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, " Lc={}", data.len())?;
        }
        if let Some(le) = self.le {
            write!(f, " Le={le}")?;
        }
        Ok(())
    }
}

/// A typed command APDU paired with typed response parsing
pub trait ApduCommand {
    /// Parsed success payload
    type Success;
    /// Error produced while executing or parsing
    type Error: From<Error> + fmt::Debug;

    /// Build the wire command
    fn to_command(&self) -> Command;

    /// Interpret the card's response
    fn parse_response(response: Response) -> Result<Self::Success, Self::Error>;
}
