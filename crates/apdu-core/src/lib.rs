//! Core traits and types for ISO 7816-4 APDU exchanges with smartcards.
//!
//! This crate provides the protocol-agnostic plumbing a smartcard stack is
//! built on:
//!
//! - [`Command`] and [`Response`] — command/response APDUs, short and
//!   extended length encodings, typed pairing via [`ApduCommand`]
//! - [`StatusWord`] — SW1-SW2 classification helpers
//! - [`CardTransport`] — the single injected I/O seam; implement it once per
//!   reader technology (or per test script) and every layer above works
//! - [`SecureChannel`] and [`SecurityLevel`] — transports layered over other
//!   transports that protect traffic
//! - [`CardExecutor`] — drives typed commands and resolves `61 xx` GET
//!   RESPONSE chaining
//!
//! Protocol-specific logic (PACE, EAC, PIN management) lives in higher-level
//! crates built on these traits.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod command;
pub mod executor;
pub mod response;
pub mod secure;
pub mod transport;

mod error;

// Re-export commonly used types at the crate root
pub use command::{ApduCommand, Command, ExpectedLength};
pub use error::{Error, Result, ResultExt};
pub use executor::{CardExecutor, Executor};
pub use response::Response;
pub use response::status::StatusWord;
pub use secure::{SecureChannel, SecurityLevel};
pub use transport::CardTransport;

// Re-export bytes since it appears throughout the public API
pub use bytes;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::command::{ApduCommand, Command, ExpectedLength};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::executor::{CardExecutor, Executor};
    pub use crate::response::Response;
    pub use crate::response::status::{self, StatusWord};
    pub use crate::secure::{SecureChannel, SecurityLevel};
    pub use crate::transport::CardTransport;
}
