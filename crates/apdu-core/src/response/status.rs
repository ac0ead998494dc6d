//! Status word (SW1-SW2) definitions and helpers
//!
//! Every response APDU ends with a two-byte status word. This module provides
//! a typed wrapper with the classification helpers the protocol layers need,
//! including the retry-counter encoding German eID cards use on `63 Cx`.

use core::fmt;

use tracing::Level;

/// APDU response status word (SW1-SW2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word from SW1 and SW2 bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create a status word from a u16 value (SW1 high byte, SW2 low byte)
    pub const fn from_u16(sw: u16) -> Self {
        Self {
            sw1: (sw >> 8) as u8,
            sw2: (sw & 0xFF) as u8,
        }
    }

    /// Convert to a u16 value
    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Check if this is the success status (0x9000)
    pub const fn is_success(self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Check whether processing completed normally (0x9000 or 0x61xx)
    pub const fn is_normal_processing(self) -> bool {
        self.is_success() || self.sw1 == 0x61
    }

    /// Number of response bytes still available via GET RESPONSE (0x61xx)
    pub const fn remaining_bytes(self) -> Option<u8> {
        if self.sw1 == 0x61 { Some(self.sw2) } else { None }
    }

    /// Check whether this is a warning status (0x62xx or 0x63xx)
    pub const fn is_warning(self) -> bool {
        self.sw1 == 0x62 || self.sw1 == 0x63
    }

    /// Remaining verification attempts encoded in the low nibble of SW2.
    ///
    /// Returns `Some(n)` for `63 Cn`. Treating the nibble as a retry counter
    /// is a convention of the German eID card profile (and ICAO MRTDs), not a
    /// universal ISO 7816 semantic; other card operating systems may use
    /// `63 Cx` differently.
    pub const fn retry_counter(self) -> Option<u8> {
        if self.sw1 == 0x63 && (self.sw2 & 0xF0) == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Check for "security condition not satisfied" (0x6982)
    pub const fn is_security_condition_not_satisfied(self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x82
    }

    /// Check for "authentication method blocked" (0x6983)
    pub const fn is_authentication_method_blocked(self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x83
    }

    /// Check for "file or application not found" (0x6A82)
    pub const fn is_file_not_found(self) -> bool {
        self.sw1 == 0x6A && self.sw2 == 0x82
    }

    /// Check for "selected file deactivated" (0x6283)
    pub const fn is_file_deactivated(self) -> bool {
        self.sw1 == 0x62 && self.sw2 == 0x83
    }

    /// Suggested tracing level when logging this status word
    pub fn tracing_level(self) -> Level {
        if self.is_normal_processing() {
            Level::TRACE
        } else if self.is_warning() {
            Level::DEBUG
        } else {
            Level::WARN
        }
    }

    /// Human-readable interpretation of the status word
    pub fn description(self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, 0x82) => "End of file reached before reading expected bytes",
            (0x62, 0x83) => "Selected file deactivated",
            (0x63, 0x00) => "Authentication failed",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Verification failed, counter in low nibble",
            (0x65, 0x81) => "Memory failure",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x83) => "Final command of chain expected",
            (0x68, 0x84) => "Command chaining not supported",
            (0x69, 0x82) => "Security condition not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x84) => "Reference data not usable",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x87) => "Expected secure messaging data objects missing",
            (0x69, 0x88) => "Secure messaging data objects incorrect",
            (0x6A, 0x80) => "Incorrect parameters in data field",
            (0x6A, 0x82) => "File or application not found",
            (0x6A, 0x86) => "Incorrect P1/P2 parameters",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6D, 0x00) => "Instruction not supported",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(sw: u16) -> Self {
        Self::from_u16(sw)
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from((sw1, sw2): (u8, u8)) -> Self {
        Self::new(sw1, sw2)
    }
}

impl From<StatusWord> for u16 {
    fn from(sw: StatusWord) -> Self {
        sw.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Frequently used status words
pub mod common {
    use super::StatusWord;

    /// Normal processing (0x9000)
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);
    /// Selected file deactivated (0x6283)
    pub const FILE_DEACTIVATED: StatusWord = StatusWord::new(0x62, 0x83);
    /// Authentication failed (0x6300)
    pub const AUTHENTICATION_FAILED: StatusWord = StatusWord::new(0x63, 0x00);
    /// Wrong length (0x6700)
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);
    /// Security condition not satisfied (0x6982)
    pub const SECURITY_CONDITION_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
    /// Authentication method blocked (0x6983)
    pub const AUTHENTICATION_METHOD_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);
    /// Reference data not usable (0x6984)
    pub const REFERENCE_DATA_NOT_USABLE: StatusWord = StatusWord::new(0x69, 0x84);
    /// Conditions of use not satisfied (0x6985)
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);
    /// Incorrect parameters in the data field (0x6A80)
    pub const WRONG_DATA: StatusWord = StatusWord::new(0x6A, 0x80);
    /// File or application not found (0x6A82)
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
    /// Referenced data not found (0x6A88)
    pub const REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x88);
}
