//! EAC/PACE security protocol engine for the German eID card (BSI TR-03110).
//!
//! This crate implements the terminal side of the Extended Access Control
//! protocol stack, from the BER codec up to the service access layer:
//!
//! - [`tlv`] and [`oid`] — arena-backed BER-TLV codec and object identifier
//!   handling for the card's ASN.1 structures
//! - [`securityinfo`] — the `SecurityInfos` announcements read from
//!   EF.CardAccess and EF.CardSecurity
//! - [`cvc`] — card verifiable certificates, certificate chains and the
//!   certificate holder authorization template (CHAT)
//! - [`pace`] — Password Authenticated Connection Establishment, upgrading
//!   the plaintext channel to password-derived session keys
//! - [`ta`] and [`ca`] — Terminal Authentication and Chip Authentication,
//!   proving the terminal's rights and the chip's genuineness
//! - [`pin`] — PIN comparison against an already-verified channel
//! - [`secure_messaging`] — the ISO 7816-4 secure messaging wrapper that
//!   protects every command once a channel is keyed
//! - [`session`] and [`dispatch`] — per-card connection state and the typed
//!   DID protocol dispatch that drives all of the above
//!
//! Card I/O goes through the [`perso_apdu_core`] traits; any
//! [`CardTransport`] implementation works, from PC/SC readers to scripted
//! test transports.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod ca;
pub mod commands;
pub mod crypto;
pub mod cvc;
pub mod dispatch;
pub mod oid;
pub mod pace;
pub mod pin;
pub mod secure_messaging;
pub mod securityinfo;
pub mod session;
pub mod ta;
pub mod tlv;

mod error;

// Re-export commonly used types at the crate root
pub use ca::{ChipAuthentication, ChipAuthenticationOutput, EphemeralKeyPair};
pub use cvc::{CardVerifiableCertificate, CertificateChain, Chat, CvcDate, PublicKeyReference};
pub use dispatch::{
    AuthenticationData, AuthenticationResponse, DidAuthenticateRequest, DidProtocol,
    Eac1Input, Eac1Output, Eac2Input, Eac2Output, ProtocolFunction, ProtocolRegistry, Sal,
    EAC_PROTOCOL, PIN_COMPARE_PROTOCOL,
};
pub use error::{Error, Result};
pub use oid::Oid;
pub use pace::{Pace, PaceOutput, PacePassword};
pub use pin::{PinCompare, PinInput};
pub use secure_messaging::{EacSecureChannel, SecureMessaging, SessionKeys};
pub use securityinfo::SecurityInfos;
pub use session::CardSession;
pub use ta::{TerminalAuthentication, TerminalSigner};

// Re-export the I/O seam so downstream crates rarely need perso-apdu-core
// as a direct dependency
pub use perso_apdu_core::{CardExecutor, CardTransport, Executor, SecureChannel};

// Re-export bytes since it appears throughout the public API
pub use bytes;
