//! # Certificate-Authenticated Identity
//!
//! Each party holds an identity chain rooted in a shared CA list. Requests
//! and tickets carry detached signatures plus the signer's chain; `open`
//! verifies the chain against the roots and the signature against the leaf
//! key. A second "log" signature over a separate domain accompanies every
//! request so the Transcryptor can store a non-repudiable shadow.

use std::marker::PhantomData;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha2::{Digest, Sha256};

use crate::error::PepError;

const MAIN_SIGNATURE_DOMAIN: &[u8] = b"pep.sig.main";
const LOG_SIGNATURE_DOMAIN: &[u8] = b"pep.sig.log";

/// The to-be-signed body of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    /// Common name of the holder.
    pub subject: String,
    /// The user group this identity acts as, if any.
    pub user_group: Option<String>,
    /// Common name of the issuing certificate.
    pub issuer: String,
    /// Ed25519 verifying key of the holder.
    pub public_key: [u8; 32],
}

/// A leaf or intermediate certificate.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub body: CertificateBody,
    /// Issuer's signature over the serialized body.
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: [u8; 64],
}

impl Certificate {
    /// Issues a certificate for `body` under the issuer's signing key.
    pub fn issue(body: CertificateBody, issuer_key: &SigningKey) -> Result<Certificate, PepError> {
        let bytes = bincode::serialize(&body)?;
        let signature = issuer_key.sign(&bytes).to_bytes();
        Ok(Certificate { body, signature })
    }

    /// SHA-256 of the serialized certificate.
    pub fn fingerprint(&self) -> Result<[u8; 32], PepError> {
        let bytes = bincode::serialize(self)?;
        let digest = Sha256::digest(&bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    fn verify_issued_by(&self, issuer_key: &[u8; 32]) -> Result<(), PepError> {
        let key = VerifyingKey::from_bytes(issuer_key)
            .map_err(|_| PepError::invalid("malformed issuer key"))?;
        let bytes = bincode::serialize(&self.body)?;
        key.verify(&bytes, &Signature::from_bytes(&self.signature))
            .map_err(|_| PepError::access_denied("certificate signature invalid"))
    }
}

/// An identity chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CertificateChain(pub Vec<Certificate>);

impl CertificateChain {
    /// The leaf certificate, if any.
    pub fn leaf(&self) -> Option<&Certificate> {
        self.0.first()
    }

    /// The user group asserted by the leaf.
    pub fn user_group(&self) -> Option<&str> {
        self.leaf().and_then(|c| c.body.user_group.as_deref())
    }

    /// Verifies the chain: every certificate is signed by its parent and
    /// the last one by a trusted root. Returns the leaf verifying key.
    pub fn verify(&self, root_cas: &RootCas) -> Result<VerifyingKey, PepError> {
        let leaf = self
            .leaf()
            .ok_or_else(|| PepError::access_denied("empty certificate chain"))?;
        for pair in self.0.windows(2) {
            pair[0].verify_issued_by(&pair[1].body.public_key)?;
        }
        let last = match self.0.last() {
            Some(last) => last,
            None => return Err(PepError::access_denied("empty certificate chain")),
        };
        if !root_cas.trusts(&last.body.public_key) {
            return Err(PepError::access_denied("certificate chain not rooted in CA"));
        }
        // The anchor is self-signed.
        last.verify_issued_by(&last.body.public_key)?;
        VerifyingKey::from_bytes(&leaf.body.public_key)
            .map_err(|_| PepError::invalid("malformed leaf key"))
    }
}

/// The set of trusted root CA keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RootCas(pub Vec<[u8; 32]>);

impl RootCas {
    pub fn trusts(&self, key: &[u8; 32]) -> bool {
        self.0.iter().any(|ca| ca == key)
    }
}

/// A signing identity: a key pair plus its certificate chain.
pub struct Identity {
    signing_key: SigningKey,
    chain: CertificateChain,
}

impl Identity {
    pub fn new(signing_key: SigningKey, chain: CertificateChain) -> Identity {
        Identity { signing_key, chain }
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    pub fn user_group(&self) -> Option<&str> {
        self.chain.user_group()
    }

    /// Signs `data` under the given domain tag.
    pub fn sign_domain(&self, domain: &[u8], data: &[u8]) -> [u8; 64] {
        let mut message = Vec::with_capacity(domain.len() + data.len());
        message.extend_from_slice(domain);
        message.extend_from_slice(data);
        self.signing_key.sign(&message).to_bytes()
    }

    /// Signs arbitrary data (no domain separation); used for ticket
    /// signatures where the domain is carried by the ticket type itself.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }
}

/// Verifies a domain-separated signature against a verifying key.
pub fn verify_domain(
    key: &VerifyingKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8; 64],
) -> Result<(), PepError> {
    let mut message = Vec::with_capacity(domain.len() + data.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(data);
    key.verify(&message, &Signature::from_bytes(signature))
        .map_err(|_| PepError::access_denied("signature invalid"))
}

/// Builds a root CA, a set of trusted roots and an identity issued under
/// it. Intended for tests and bootstrap tooling.
pub struct IdentityAuthority {
    root_key: SigningKey,
    root_cert: Certificate,
}

impl IdentityAuthority {
    pub fn new(name: &str) -> Result<IdentityAuthority, PepError> {
        let root_key = SigningKey::generate(&mut OsRng);
        let body = CertificateBody {
            subject: name.to_string(),
            user_group: None,
            issuer: name.to_string(),
            public_key: root_key.verifying_key().to_bytes(),
        };
        let root_cert = Certificate::issue(body, &root_key)?;
        Ok(IdentityAuthority { root_key, root_cert })
    }

    pub fn root_cas(&self) -> RootCas {
        RootCas(vec![self.root_cert.body.public_key])
    }

    /// Issues a fresh identity for `subject` acting as `user_group`.
    pub fn issue(&self, subject: &str, user_group: Option<&str>) -> Result<Identity, PepError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let body = CertificateBody {
            subject: subject.to_string(),
            user_group: user_group.map(|g| g.to_string()),
            issuer: self.root_cert.body.subject.clone(),
            public_key: signing_key.verifying_key().to_bytes(),
        };
        let leaf = Certificate::issue(body, &self.root_key)?;
        let chain = CertificateChain(vec![leaf, self.root_cert.clone()]);
        Ok(Identity::new(signing_key, chain))
    }
}

/// A signed envelope around a serialized value: the main signature, the
/// log-signature shadow, and the signer's chain.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed<T> {
    /// Serialized inner value.
    pub data: Vec<u8>,
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: [u8; 64],
    #[serde_as(as = "serde_with::Bytes")]
    pub log_signature: [u8; 64],
    pub certificate_chain: CertificateChain,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Signed<T> {
    pub fn new(value: &T, identity: &Identity) -> Result<Signed<T>, PepError> {
        let data = bincode::serialize(value)?;
        let signature = identity.sign_domain(MAIN_SIGNATURE_DOMAIN, &data);
        let log_signature = identity.sign_domain(LOG_SIGNATURE_DOMAIN, &data);
        Ok(Signed {
            data,
            signature,
            log_signature,
            certificate_chain: identity.chain().clone(),
            _marker: PhantomData,
        })
    }

    /// The user group asserted by the embedded chain (unverified).
    pub fn claimed_user_group(&self) -> Option<&str> {
        self.certificate_chain.user_group()
    }

    /// Verifies the chain and both signatures, returning the inner value.
    pub fn open(&self, root_cas: &RootCas) -> Result<T, PepError> {
        let key = self.certificate_chain.verify(root_cas)?;
        verify_domain(&key, MAIN_SIGNATURE_DOMAIN, &self.data, &self.signature)?;
        verify_domain(&key, LOG_SIGNATURE_DOMAIN, &self.data, &self.log_signature)?;
        Ok(bincode::deserialize(&self.data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn signed_envelope_round_trips() {
        let authority = IdentityAuthority::new("TestCA").unwrap();
        let identity = authority.issue("alice", Some("Researcher")).unwrap();
        let signed = Signed::new(&Payload { value: 7 }, &identity).unwrap();
        assert_eq!(signed.claimed_user_group(), Some("Researcher"));
        let opened = signed.open(&authority.root_cas()).unwrap();
        assert_eq!(opened, Payload { value: 7 });
    }

    #[test]
    fn tampered_data_rejected() {
        let authority = IdentityAuthority::new("TestCA").unwrap();
        let identity = authority.issue("alice", None).unwrap();
        let mut signed = Signed::new(&Payload { value: 7 }, &identity).unwrap();
        signed.data = bincode::serialize(&Payload { value: 8 }).unwrap();
        assert!(signed.open(&authority.root_cas()).is_err());
    }

    #[test]
    fn foreign_root_rejected() {
        let authority = IdentityAuthority::new("TestCA").unwrap();
        let other = IdentityAuthority::new("OtherCA").unwrap();
        let identity = authority.issue("alice", None).unwrap();
        let signed = Signed::new(&Payload { value: 7 }, &identity).unwrap();
        assert!(signed.open(&other.root_cas()).is_err());
    }

    #[test]
    fn chain_verification_checks_intermediates() {
        let authority = IdentityAuthority::new("TestCA").unwrap();
        let identity = authority.issue("alice", None).unwrap();
        let mut chain = identity.chain().clone();
        // Corrupt the leaf signature.
        chain.0[0].signature[0] ^= 0xff;
        assert!(chain.verify(&authority.root_cas()).is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        let authority = IdentityAuthority::new("TestCA").unwrap();
        let identity = authority.issue("alice", None).unwrap();
        let leaf = identity.chain().leaf().unwrap();
        assert_eq!(leaf.fingerprint().unwrap(), leaf.fingerprint().unwrap());
    }
}
