//! Certificate chain resolution and validation.
//!
//! Chains run issuer-first: country verifying CA (CVCA), document verifier
//! (DV), then the terminal certificate. The chip only trusts chains rooted
//! in the CAR it announces, so after building and checking a chain the
//! caller slices off the presentation suffix starting at that reference.

use crate::cvc::certificate::{CardVerifiableCertificate, CvcDate, PublicKeyReference};
use crate::cvc::chat::Role;
use crate::error::{Error, Result};

/// Issuer lookups stop after this many certificates; protects against
/// reference cycles and unbounded chains
const LOOKUP_BUDGET: usize = 8;

/// An issuer-first chain of card-verifiable certificates
#[derive(Clone, Debug)]
pub struct CertificateChain {
    certificates: Vec<CardVerifiableCertificate>,
}

impl CertificateChain {
    /// Build a chain from a leaf certificate by resolving `issuer(CAR)`
    /// until a self-signed root is reached. Fails with
    /// [`Error::ChainIncomplete`] when an issuer cannot be resolved or the
    /// lookup budget runs out (reference cycle).
    pub fn build<F>(leaf: CardVerifiableCertificate, mut issuer: F) -> Result<Self>
    where
        F: FnMut(&PublicKeyReference) -> Option<CardVerifiableCertificate>,
    {
        let mut chain = vec![leaf];
        loop {
            let current = &chain[chain.len() - 1];
            if current.is_self_signed() {
                break;
            }
            if chain.len() == LOOKUP_BUDGET {
                return Err(Error::ChainIncomplete);
            }
            let next = issuer(current.car()).ok_or(Error::ChainIncomplete)?;
            chain.push(next);
        }
        chain.reverse();
        Ok(Self {
            certificates: chain,
        })
    }

    /// The certificates, issuer-first
    pub fn certificates(&self) -> &[CardVerifiableCertificate] {
        &self.certificates
    }

    /// The terminal (end-entity) certificate
    pub fn leaf(&self) -> &CardVerifiableCertificate {
        &self.certificates[self.certificates.len() - 1]
    }

    /// Check CAR/CHR linkage, role ordering and validity periods. `today`
    /// is the chip's notion of the current date, which may lag the host.
    pub fn verify(&self, today: CvcDate) -> Result<()> {
        if self.certificates[0].chat().role() != Role::Cvca {
            return Err(Error::CertificateChainInvalid(
                "chain root is not a CVCA certificate",
            ));
        }
        for pair in self.certificates.windows(2) {
            let (issuer, holder) = (&pair[0], &pair[1]);
            if issuer.chr() != holder.car() {
                return Err(Error::CertificateChainInvalid(
                    "holder does not chain to its issuer",
                ));
            }
            let issuer_rank = issuer.chat().role().rank();
            let holder_rank = holder.chat().role().rank();
            // CVCA link certificates stay on the same level; every other
            // step must descend.
            let link = issuer_rank == Role::Cvca.rank() && holder_rank == Role::Cvca.rank();
            if !link && issuer_rank <= holder_rank {
                return Err(Error::CertificateChainInvalid(
                    "certificate roles out of order",
                ));
            }
        }
        if self.certificates.iter().any(|c| !c.is_valid_at(today)) {
            return Err(Error::CertificateExpired);
        }
        Ok(())
    }

    /// The suffix of the chain to present to a chip that trusts
    /// `trusted_car`: the first certificate issued under that reference and
    /// everything below it. The chip holds the trust point key itself, so a
    /// self-signed root never goes over the wire.
    pub fn presentation_order(
        &self,
        trusted_car: &PublicKeyReference,
    ) -> Result<&[CardVerifiableCertificate]> {
        let start = self
            .certificates
            .iter()
            .position(|c| !c.is_self_signed() && c.car() == trusted_car)
            .ok_or(Error::ChainIncomplete)?;
        Ok(&self.certificates[start..])
    }
}
