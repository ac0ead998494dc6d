//! Card-verifiable certificates, holder authorization templates and chain
//! handling for terminal authentication.

mod certificate;
mod chain;
mod chat;

pub use certificate::{CardVerifiableCertificate, CvcDate, CvcPublicKey, PublicKeyReference};
pub use chain::CertificateChain;
pub use chat::{Chat, DataGroup, Role, SpecialFunction, TerminalType};

#[cfg(test)]
pub(crate) use certificate::tests::{build_certificate, build_certificate_with};
