//! # Discrete-Log Equality Proofs
//!
//! A generalized Chaum-Pedersen sigma protocol: one exponent, several
//! `(base, image)` pairs, made non-interactive with Fiat-Shamir over
//! SHA-512. Proves `image_i = secret * base_i` for every pair without
//! revealing the secret.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use pep_curve::{GroupElement, Scalar};

use crate::errors::PepCryptoError;

const TRANSCRIPT_TAG: &[u8] = b"pep.dleq.v1";

/// A non-interactive proof of a shared discrete logarithm across several
/// base/image pairs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlEqProof {
    /// Packed commitments `w * base_i`.
    commitments: Vec<[u8; 32]>,
    /// Response `w + challenge * secret`.
    z: [u8; 32],
}

fn challenge(
    context: &[u8],
    bases: &[GroupElement],
    images: &[GroupElement],
    commitments: &[[u8; 32]],
) -> Scalar {
    let mut h = Sha512::new();
    h.update(TRANSCRIPT_TAG);
    h.update((context.len() as u64).to_be_bytes());
    h.update(context);
    for (b, i) in bases.iter().zip(images.iter()) {
        h.update(b.pack());
        h.update(i.pack());
    }
    for t in commitments {
        h.update(t);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&h.finalize());
    Scalar::from_hash(&wide)
}

impl DlEqProof {
    /// Proves that `images[i] == secret * bases[i]` for all pairs.
    pub fn prove<R: RngCore + CryptoRng>(
        secret: &Scalar,
        bases: &[GroupElement],
        images: &[GroupElement],
        context: &[u8],
        rng: &mut R,
    ) -> DlEqProof {
        debug_assert_eq!(bases.len(), images.len());
        let w = Scalar::random(rng);
        let commitments: Vec<[u8; 32]> = bases.iter().map(|b| b.scalar_mult(&w).pack()).collect();
        let c = challenge(context, bases, images, &commitments);
        let z = w.add(&c.mul(secret));
        DlEqProof {
            commitments,
            z: z.pack(),
        }
    }

    /// Verifies against public bases and images; variable-time.
    pub fn verify(
        &self,
        bases: &[GroupElement],
        images: &[GroupElement],
        context: &[u8],
    ) -> Result<(), PepCryptoError> {
        if bases.len() != images.len() || bases.len() != self.commitments.len() {
            return Err(PepCryptoError::ProofRejected);
        }
        let c = challenge(context, bases, images, &self.commitments);
        let z = Scalar::unpack(&self.z);
        for ((base, image), t_packed) in bases.iter().zip(images.iter()).zip(&self.commitments) {
            let t = GroupElement::unpack(t_packed).map_err(|_| PepCryptoError::ProofRejected)?;
            let lhs = base.scalar_mult_vartime(&z);
            let rhs = t.add(&image.scalar_mult_vartime(&c));
            if !lhs.equals(&rhs) {
                return Err(PepCryptoError::ProofRejected);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn valid_proof_verifies() {
        let mut rng = thread_rng();
        let secret = Scalar::random(&mut rng);
        let g = *GroupElement::base();
        let h = GroupElement::hash_from_string(b"second base");
        let bases = [g, h];
        let images = [g.scalar_mult(&secret), h.scalar_mult(&secret)];
        let proof = DlEqProof::prove(&secret, &bases, &images, b"ctx", &mut rng);
        assert!(proof.verify(&bases, &images, b"ctx").is_ok());
    }

    #[test]
    fn wrong_image_rejected() {
        let mut rng = thread_rng();
        let secret = Scalar::random(&mut rng);
        let other = Scalar::random(&mut rng);
        let g = *GroupElement::base();
        let h = GroupElement::hash_from_string(b"second base");
        let bases = [g, h];
        let images = [g.scalar_mult(&secret), h.scalar_mult(&other)];
        let proof = DlEqProof::prove(&secret, &bases, &images, b"ctx", &mut rng);
        assert!(proof.verify(&bases, &images, b"ctx").is_err());
    }

    #[test]
    fn context_binds() {
        let mut rng = thread_rng();
        let secret = Scalar::random(&mut rng);
        let g = *GroupElement::base();
        let bases = [g];
        let images = [g.scalar_mult(&secret)];
        let proof = DlEqProof::prove(&secret, &bases, &images, b"ctx-a", &mut rng);
        assert!(proof.verify(&bases, &images, b"ctx-b").is_err());
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let mut rng = thread_rng();
        let secret = Scalar::random(&mut rng);
        let g = *GroupElement::base();
        let proof = DlEqProof::prove(&secret, &[g], &[g.scalar_mult(&secret)], b"c", &mut rng);
        assert!(proof.verify(&[g, g], &[g, g], b"c").is_err());
    }
}
