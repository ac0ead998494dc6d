//! Cryptographic building blocks for the authentication protocols.
//!
//! [`sym`] covers the symmetric side (key derivation, CBC encryption, CMAC
//! authentication tokens), [`elliptic`] the ECDH key agreements on the
//! standardized domain parameters.

pub mod elliptic;
pub mod sym;
