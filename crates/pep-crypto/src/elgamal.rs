//! # ElGamal over the Edwards Group
//!
//! The ciphertext triple `(b, c, y) = (r*B, m + r*Y, Y)` carries its public
//! key so that it can be rerandomized, rekeyed and reshuffled without any
//! secret. These three operations are the polymorphic-encryption toolkit:
//!
//! - `rerandomize` refreshes the randomness, leaving the plaintext and key
//!   domain untouched;
//! - `rekey(k)` moves the ciphertext to the key domain `k*Y`;
//! - `reshuffle(n)` multiplies the plaintext by `n`, which turns one
//!   encrypted identity into unlinkable per-domain pseudonyms.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use pep_curve::{GroupElement, Scalar};

use crate::errors::PepCryptoError;

/// An ElGamal ciphertext over the curve group.
#[derive(Clone, Copy, Debug)]
pub struct ElGamal {
    /// Randomness component `r*B`.
    pub b: GroupElement,
    /// Payload component `m + r*Y`.
    pub c: GroupElement,
    /// The public key the ciphertext currently targets.
    pub y: GroupElement,
}

/// Packed 96-byte wire/storage form of a ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackedElGamal {
    b: [u8; 32],
    c: [u8; 32],
    y: [u8; 32],
}

impl std::fmt::Debug for PackedElGamal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackedElGamal({:02x}{:02x}..)", self.b[0], self.b[1])
    }
}

impl PackedElGamal {
    /// Flat 96-byte form, `b || c || y`.
    pub fn to_bytes(&self) -> [u8; 96] {
        let mut out = [0u8; 96];
        out[..32].copy_from_slice(&self.b);
        out[32..64].copy_from_slice(&self.c);
        out[64..].copy_from_slice(&self.y);
        out
    }

    /// Parses the flat 96-byte form without validating the points.
    pub fn from_bytes(bytes: &[u8]) -> Result<PackedElGamal, PepCryptoError> {
        if bytes.len() != 96 {
            return Err(PepCryptoError::InvalidCiphertext);
        }
        let mut p = PackedElGamal {
            b: [0; 32],
            c: [0; 32],
            y: [0; 32],
        };
        p.b.copy_from_slice(&bytes[..32]);
        p.c.copy_from_slice(&bytes[32..64]);
        p.y.copy_from_slice(&bytes[64..]);
        Ok(p)
    }

    /// Validates and unpacks all three components.
    pub fn unpack(&self) -> Result<ElGamal, PepCryptoError> {
        Ok(ElGamal {
            b: GroupElement::unpack(&self.b)?,
            c: GroupElement::unpack(&self.c)?,
            y: GroupElement::unpack(&self.y)?,
        })
    }
}

impl ElGamal {
    /// Encrypts a group element under `pk`.
    pub fn encrypt<R: RngCore + CryptoRng>(
        pk: &GroupElement,
        m: &GroupElement,
        rng: &mut R,
    ) -> ElGamal {
        let r = Scalar::random(rng);
        ElGamal {
            b: GroupElement::scalar_mult_base(&r),
            c: m.add(&pk.scalar_mult(&r)),
            y: *pk,
        }
    }

    /// Decrypts with the secret key matching `y`.
    pub fn decrypt(&self, sk: &Scalar) -> GroupElement {
        self.c.sub(&self.b.scalar_mult(sk))
    }

    /// Fresh randomness, same plaintext and key domain.
    pub fn rerandomize<R: RngCore + CryptoRng>(&self, rng: &mut R) -> ElGamal {
        self.rerandomize_with(&Scalar::random(rng))
    }

    /// Rerandomization with a caller-chosen factor.
    pub fn rerandomize_with(&self, s: &Scalar) -> ElGamal {
        ElGamal {
            b: self.b.add(&GroupElement::scalar_mult_base(s)),
            c: self.c.add(&self.y.scalar_mult(s)),
            y: self.y,
        }
    }

    /// Moves the ciphertext from key domain `Y` to `k*Y`.
    pub fn rekey(&self, k: &Scalar) -> ElGamal {
        ElGamal {
            b: self.b.scalar_mult(&k.invert()),
            c: self.c,
            y: self.y.scalar_mult(k),
        }
    }

    /// Multiplies the plaintext by `n`.
    pub fn reshuffle(&self, n: &Scalar) -> ElGamal {
        ElGamal {
            b: self.b.scalar_mult(n),
            c: self.c.scalar_mult(n),
            y: self.y,
        }
    }

    /// The combined rekey-and-reshuffle step used by translation.
    pub fn rsk(&self, k: &Scalar, n: &Scalar) -> ElGamal {
        self.rekey(k).reshuffle(n)
    }

    pub fn pack(&self) -> PackedElGamal {
        PackedElGamal {
            b: self.b.pack(),
            c: self.c.pack(),
            y: self.y.pack(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn keypair(rng: &mut impl RngCore) -> (Scalar, GroupElement) {
        let mut wide = [0u8; 64];
        rng.fill_bytes(&mut wide);
        let sk = Scalar::from_hash(&wide);
        (sk, GroupElement::scalar_mult_base(&sk))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut rng = thread_rng();
        let (sk, pk) = keypair(&mut rng);
        let m = GroupElement::hash_from_string(b"message point");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng);
        assert!(ct.decrypt(&sk).equals(&m));
    }

    #[test]
    fn rerandomize_preserves_plaintext() {
        let mut rng = thread_rng();
        let (sk, pk) = keypair(&mut rng);
        let m = GroupElement::hash_from_string(b"stable plaintext");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng);
        let ct2 = ct.rerandomize(&mut rng);
        assert!(!ct.b.equals(&ct2.b));
        assert!(ct2.decrypt(&sk).equals(&m));
    }

    #[test]
    fn rekey_moves_key_domain() {
        let mut rng = thread_rng();
        let (sk, pk) = keypair(&mut rng);
        let k = Scalar::random(&mut rng);
        let m = GroupElement::hash_from_string(b"rekeyed");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng).rekey(&k);
        // New secret is k * sk.
        let sk2 = k.mul(&sk);
        assert!(ct.y.equals(&pk.scalar_mult(&k)));
        assert!(ct.decrypt(&sk2).equals(&m));
    }

    #[test]
    fn reshuffle_multiplies_plaintext() {
        let mut rng = thread_rng();
        let (sk, pk) = keypair(&mut rng);
        let n = Scalar::random(&mut rng);
        let m = GroupElement::hash_from_string(b"shuffled");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng).reshuffle(&n);
        assert!(ct.decrypt(&sk).equals(&m.scalar_mult(&n)));
    }

    #[test]
    fn reshuffle_inverts() {
        let mut rng = thread_rng();
        let (sk, pk) = keypair(&mut rng);
        let n = Scalar::random(&mut rng);
        let m = GroupElement::hash_from_string(b"blind then unblind");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng);
        let round = ct.reshuffle(&n).reshuffle(&n.invert());
        assert!(round.decrypt(&sk).equals(&m));
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let mut rng = thread_rng();
        let (_, pk) = keypair(&mut rng);
        let m = GroupElement::hash_from_string(b"packed");
        let ct = ElGamal::encrypt(&pk, &m, &mut rng);
        let packed = ct.pack();
        let back = packed.unpack().unwrap();
        assert!(back.b.equals(&ct.b));
        assert!(back.c.equals(&ct.c));
        assert!(back.y.equals(&ct.y));
        assert_eq!(
            PackedElGamal::from_bytes(&packed.to_bytes()).unwrap(),
            packed
        );
    }
}
