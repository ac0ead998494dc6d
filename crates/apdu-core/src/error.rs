//! Error types for APDU operations
//!
//! This module provides a consolidated error type for everything that can go
//! wrong between building a command APDU and interpreting the card's answer:
//! transport faults, malformed commands/responses, unexpected status words and
//! secure-channel violations.

use crate::response::status::StatusWord;

/// Result type alias using the consolidated error
pub type Result<T> = core::result::Result<T, Error>;

/// Consolidated error type for APDU operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ------------------- Transport errors -------------------
    /// Failed to connect to the reader or card
    #[error("Failed to connect to device")]
    ConnectionFailed,

    /// Failed to transmit or receive data
    #[error("Failed to transmit data")]
    TransmissionFailed,

    /// The card was removed while a session was in progress
    #[error("Card was removed during the session")]
    CardRemoved,

    /// Reader driver reported an error code
    #[error("Reader driver error code: {0}")]
    Driver(i32),

    // ------------------- Response errors -------------------
    /// Response shorter than a status word
    #[error("Incomplete response")]
    IncompleteResponse,

    /// Parsing failed with a specific message
    #[error("Parse error: {0}")]
    ParseError(&'static str),

    /// Card returned a non-success status word
    #[error("Status {status}{}", message.map(|m| format!(": {m}")).unwrap_or_default())]
    Status {
        /// Status word returned by the card
        status: StatusWord,
        /// Optional human-readable context
        message: Option<&'static str>,
    },

    /// GET RESPONSE chaining exceeded the configured limit
    #[error("Response chaining exceeded the limit")]
    ResponseChainLimit,

    // ------------------- Command errors -------------------
    /// Command data field exceeds what the encoding can carry
    #[error("Command data too long: {0} bytes (max {1})")]
    DataTooLong(usize, usize),

    /// Raw command bytes do not form a valid APDU
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    // ------------------- Secure channel errors -------------------
    /// Operation requires an established secure channel
    #[error("Secure channel not established")]
    SecureChannelNotEstablished,

    /// Active security level does not satisfy the command's requirement
    #[error("Insufficient security level")]
    InsufficientSecurityLevel,

    /// Secure messaging wrap/unwrap failed
    #[error("Secure messaging error: {0}")]
    SecureMessaging(&'static str),

    // ------------------- General errors -------------------
    /// Error with additional context
    #[error("{context}: {source}")]
    Context {
        /// Description of what was being attempted
        context: String,
        /// Underlying error
        source: Box<Self>,
    },

    /// Other error described by a static string
    #[error("{0}")]
    Other(&'static str),

    /// Other error described by an owned message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a status error from SW1/SW2
    pub const fn status(sw1: u8, sw2: u8) -> Self {
        Self::Status {
            status: StatusWord::new(sw1, sw2),
            message: None,
        }
    }

    /// Create a status error with a message
    pub const fn status_with_message(sw1: u8, sw2: u8, message: &'static str) -> Self {
        Self::Status {
            status: StatusWord::new(sw1, sw2),
            message: Some(message),
        }
    }

    /// Create a parse error
    pub const fn parse(message: &'static str) -> Self {
        Self::ParseError(message)
    }

    /// Create an error from a static string
    pub const fn other(message: &'static str) -> Self {
        Self::Other(message)
    }

    /// Create an error from an owned message
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap this error with additional context
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The status word carried by this error, if any
    pub const fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<StatusWord> for Error {
    fn from(status: StatusWord) -> Self {
        Self::Status {
            status,
            message: None,
        }
    }
}

/// Extension trait adding context to results
pub trait ResultExt<T> {
    /// Attach a context message to the error, if any
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}
