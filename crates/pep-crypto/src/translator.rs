//! # Pseudonym Translation
//!
//! Turns a polymorphic pseudonym into a party-specific ciphertext by a
//! rekey step followed by a reshuffle step, both derived deterministically
//! from the translator's master material per recipient. Each step carries a
//! discrete-log-equality proof so any holder of the published verifiers can
//! check the translation without the master secrets.
//!
//! A party obtains its stable local pseudonym by decrypting the translated
//! ciphertext with its own key share.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use pep_curve::{GroupElement, Scalar};

use crate::elgamal::{ElGamal, PackedElGamal};
use crate::errors::PepCryptoError;
use crate::keys::MasterSecret;
use crate::proofs::DlEqProof;

const REKEY_LABEL: &[u8] = b"pep.translate.rekey";
const SHUFFLE_LABEL: &[u8] = b"pep.translate.shuffle";
const REKEY_CTX: &[u8] = b"pep.translate.rekey.step";
const SHUFFLE_CTX: &[u8] = b"pep.translate.shuffle.step";

/// The key domain a translation factor applies to: participant pseudonyms
/// or polymorphic data keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDomain {
    /// Participant pseudonym translation.
    Pseudonym,
    /// Data-key rekeying.
    DataKey,
}

impl KeyDomain {
    fn tag(self) -> &'static [u8] {
        match self {
            KeyDomain::Pseudonym => b"pseudonym",
            KeyDomain::DataKey => b"data-key",
        }
    }
}

/// Public commitments to a recipient's translation factors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationVerifiers {
    /// `k * B` for the rekey factor.
    pub rekey: [u8; 32],
    /// `n * B` for the reshuffle factor.
    pub reshuffle: [u8; 32],
}

/// Proof that a translation was performed with the committed factors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationProof {
    /// Ciphertext after the rekey step, before the reshuffle step.
    pub intermediate: PackedElGamal,
    /// Proof of the rekey exponent over `(b', y, B)`.
    pub rekey: DlEqProof,
    /// Proof of the reshuffle exponent over `(b', c', B)`.
    pub reshuffle: DlEqProof,
}

/// Holds the translation master secrets; the Transcryptor owns one, the
/// Access Manager owns one for data keys.
pub struct Translator {
    master: MasterSecret,
}

impl Translator {
    pub fn new(master: MasterSecret) -> Translator {
        Translator { master }
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Translator {
        Translator {
            master: MasterSecret::generate(rng),
        }
    }

    /// Per-recipient `(rekey, reshuffle)` factors.
    pub fn factors(&self, domain: KeyDomain, recipient: &str) -> (Scalar, Scalar) {
        let k = self
            .master
            .derive_scalar(REKEY_LABEL, &[domain.tag(), recipient.as_bytes()]);
        let n = self
            .master
            .derive_scalar(SHUFFLE_LABEL, &[domain.tag(), recipient.as_bytes()]);
        (k, n)
    }

    /// The public commitments for `recipient`, checkable by anyone.
    pub fn verifiers(&self, domain: KeyDomain, recipient: &str) -> TranslationVerifiers {
        let (k, n) = self.factors(domain, recipient);
        TranslationVerifiers {
            rekey: GroupElement::scalar_mult_base(&k).pack(),
            reshuffle: GroupElement::scalar_mult_base(&n).pack(),
        }
    }

    /// Translates a ciphertext to `recipient`'s domain without a proof.
    pub fn translate(&self, ct: &ElGamal, domain: KeyDomain, recipient: &str) -> ElGamal {
        let (k, n) = self.factors(domain, recipient);
        ct.rsk(&k, &n)
    }

    /// Translates with a verifiable proof of both steps. The input must be
    /// rerandomized by the caller beforehand if unlinkability against the
    /// verifier is required; rerandomizing afterwards would break the proof
    /// relation.
    pub fn certified_translate<R: RngCore + CryptoRng>(
        &self,
        ct: &ElGamal,
        domain: KeyDomain,
        recipient: &str,
        rng: &mut R,
    ) -> (ElGamal, TranslationProof) {
        let (k, n) = self.factors(domain, recipient);

        let mid = ct.rekey(&k);
        // b = k * b', y' = k * y, V_k = k * B: one exponent, three pairs.
        let rekey_proof = DlEqProof::prove(
            &k,
            &[mid.b, ct.y, *GroupElement::base()],
            &[ct.b, mid.y, GroupElement::scalar_mult_base(&k)],
            REKEY_CTX,
            rng,
        );

        let out = mid.reshuffle(&n);
        let reshuffle_proof = DlEqProof::prove(
            &n,
            &[mid.b, mid.c, *GroupElement::base()],
            &[out.b, out.c, GroupElement::scalar_mult_base(&n)],
            SHUFFLE_CTX,
            rng,
        );

        (
            out,
            TranslationProof {
                intermediate: mid.pack(),
                rekey: rekey_proof,
                reshuffle: reshuffle_proof,
            },
        )
    }
}

/// Checks a certified translation against the published verifiers.
pub fn verify_translation(
    input: &ElGamal,
    output: &ElGamal,
    proof: &TranslationProof,
    verifiers: &TranslationVerifiers,
) -> Result<(), PepCryptoError> {
    let mid = proof.intermediate.unpack()?;
    let v_k = GroupElement::unpack(&verifiers.rekey)?;
    let v_n = GroupElement::unpack(&verifiers.reshuffle)?;

    // The rekey step leaves c untouched; the reshuffle step leaves y.
    if !mid.c.equals(&input.c) || !output.y.equals(&mid.y) {
        return Err(PepCryptoError::ProofRejected);
    }
    proof.rekey.verify(
        &[mid.b, input.y, *GroupElement::base()],
        &[input.b, mid.y, v_k],
        REKEY_CTX,
    )?;
    proof.reshuffle.verify(
        &[mid.b, mid.c, *GroupElement::base()],
        &[output.b, output.c, v_n],
        SHUFFLE_CTX,
    )?;
    Ok(())
}

/// A party's local pseudonym: decrypt the translated pseudonym with the
/// party key share and pack the point.
pub fn local_pseudonym(translated: &ElGamal, party_secret: &Scalar) -> [u8; 32] {
    translated.decrypt(party_secret).pack()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use rand::thread_rng;

    #[test]
    fn certified_translation_verifies() {
        let mut rng = thread_rng();
        let translator = Translator::generate(&mut rng);
        let kp = KeyPair::generate(&mut rng);
        let identity = GroupElement::hash_from_string(b"participant-1");
        let pp = ElGamal::encrypt(kp.public(), &identity, &mut rng);

        let (out, proof) =
            translator.certified_translate(&pp, KeyDomain::Pseudonym, "SF", &mut rng);
        let verifiers = translator.verifiers(KeyDomain::Pseudonym, "SF");
        assert!(verify_translation(&pp, &out, &proof, &verifiers).is_ok());
    }

    #[test]
    fn tampered_output_rejected() {
        let mut rng = thread_rng();
        let translator = Translator::generate(&mut rng);
        let kp = KeyPair::generate(&mut rng);
        let identity = GroupElement::hash_from_string(b"participant-2");
        let pp = ElGamal::encrypt(kp.public(), &identity, &mut rng);

        let (out, proof) =
            translator.certified_translate(&pp, KeyDomain::Pseudonym, "SF", &mut rng);
        let verifiers = translator.verifiers(KeyDomain::Pseudonym, "SF");

        let mut forged = out;
        forged.c = forged.c.double();
        assert!(verify_translation(&pp, &forged, &proof, &verifiers).is_err());
    }

    #[test]
    fn wrong_recipient_verifiers_rejected() {
        let mut rng = thread_rng();
        let translator = Translator::generate(&mut rng);
        let kp = KeyPair::generate(&mut rng);
        let identity = GroupElement::hash_from_string(b"participant-3");
        let pp = ElGamal::encrypt(kp.public(), &identity, &mut rng);

        let (out, proof) =
            translator.certified_translate(&pp, KeyDomain::Pseudonym, "SF", &mut rng);
        let other = translator.verifiers(KeyDomain::Pseudonym, "AM");
        assert!(verify_translation(&pp, &out, &proof, &other).is_err());
    }

    #[test]
    fn local_pseudonyms_are_stable_and_distinct_per_party() {
        let mut rng = thread_rng();
        let translator = Translator::generate(&mut rng);
        let kp = KeyPair::generate(&mut rng);
        let identity = GroupElement::hash_from_string(b"participant-4");

        // Two rerandomized copies of the same PP.
        let pp1 = ElGamal::encrypt(kp.public(), &identity, &mut rng);
        let pp2 = pp1.rerandomize(&mut rng);

        let (k_sf, _) = translator.factors(KeyDomain::Pseudonym, "SF");
        let sf_secret = k_sf.mul(kp.secret());
        let t1 = translator.translate(&pp1, KeyDomain::Pseudonym, "SF");
        let t2 = translator.translate(&pp2, KeyDomain::Pseudonym, "SF");
        let lp1 = local_pseudonym(&t1, &sf_secret);
        let lp2 = local_pseudonym(&t2, &sf_secret);
        assert_eq!(lp1, lp2);

        let (k_am, _) = translator.factors(KeyDomain::Pseudonym, "AM");
        let am_secret = k_am.mul(kp.secret());
        let t3 = translator.translate(&pp1, KeyDomain::Pseudonym, "AM");
        let lp3 = local_pseudonym(&t3, &am_secret);
        assert_ne!(lp1, lp3);
    }
}
