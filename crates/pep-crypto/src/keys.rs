//! # Key Material
//!
//! Scalar key pairs and domain-separated hash-to-scalar derivation. Master
//! seeds are zeroized on drop.

use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use pep_curve::{GroupElement, Scalar};

/// Derives a scalar from domain-separated byte parts (length-prefixed so
/// distinct part lists never collide).
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut h = Sha512::new();
    h.update(b"pep.scalar.v1");
    for part in parts {
        h.update((part.len() as u64).to_be_bytes());
        h.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&h.finalize());
    Scalar::from_hash(&wide)
}

/// A 32-byte master secret, wiped on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Scalar derived from this secret under a domain label.
    pub fn derive_scalar(&self, label: &[u8], parts: &[&[u8]]) -> Scalar {
        let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 2);
        all.push(label);
        all.push(&self.0);
        all.extend_from_slice(parts);
        hash_to_scalar(&all)
    }
}

/// A curve key pair; the secret scalar never leaves the struct by value.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: GroupElement,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> KeyPair {
        let secret = Scalar::random(rng);
        KeyPair {
            secret,
            public: GroupElement::scalar_mult_base(&secret),
        }
    }

    pub fn from_secret(secret: Scalar) -> KeyPair {
        KeyPair {
            secret,
            public: GroupElement::scalar_mult_base(&secret),
        }
    }

    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    pub fn public(&self) -> &GroupElement {
        &self.public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn derivation_is_deterministic_and_separated() {
        let m = MasterSecret::from_bytes([7u8; 32]);
        let a = m.derive_scalar(b"label-a", &[b"x"]);
        let b = m.derive_scalar(b"label-a", &[b"x"]);
        let c = m.derive_scalar(b"label-b", &[b"x"]);
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn length_prefix_prevents_collisions() {
        let a = hash_to_scalar(&[b"ab", b"c"]);
        let b = hash_to_scalar(&[b"a", b"bc"]);
        assert!(!a.equals(&b));
    }

    #[test]
    fn keypair_is_consistent() {
        let kp = KeyPair::generate(&mut thread_rng());
        assert!(kp
            .public()
            .equals(&GroupElement::scalar_mult_base(kp.secret())));
    }
}
