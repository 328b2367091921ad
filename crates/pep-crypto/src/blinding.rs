//! # Data-Key Blinding
//!
//! A cell's polymorphic data key is blinded with a factor derived from the
//! blinding master secret and the cell coordinates `(column, LP_AM)` plus
//! the blinding timestamp. The Access Manager's own local pseudonym is the
//! stable per-participant handle available to the party that performs both
//! blind and unblind. The same data key therefore decrypts differently for
//! every cell, and the Storage Facility alone cannot combine cells.
//!
//! `blind` is the write direction; `unblind` reverses it for reads.

use pep_curve::Scalar;

use crate::elgamal::ElGamal;
use crate::keys::MasterSecret;

const BLIND_LABEL: &[u8] = b"pep.keyblind";

/// Derives the per-cell blinding factor.
pub fn blinding_factor(
    master: &MasterSecret,
    column: &str,
    local_pseudonym_am: &[u8; 32],
    blinding_timestamp: u64,
) -> Scalar {
    master.derive_scalar(
        BLIND_LABEL,
        &[
            column.as_bytes(),
            local_pseudonym_am,
            &blinding_timestamp.to_be_bytes(),
        ],
    )
}

/// Blinds a polymorphic data key for storage in a particular cell.
pub fn blind(key: &ElGamal, factor: &Scalar) -> ElGamal {
    key.reshuffle(factor)
}

/// Reverses `blind`.
pub fn unblind(key: &ElGamal, factor: &Scalar) -> ElGamal {
    key.reshuffle(&factor.invert())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use pep_curve::GroupElement;
    use rand::thread_rng;

    #[test]
    fn blind_unblind_roundtrip() {
        let mut rng = thread_rng();
        let master = MasterSecret::generate(&mut rng);
        let kp = KeyPair::generate(&mut rng);
        let key_point = GroupElement::hash_from_string(b"data key");
        let ct = ElGamal::encrypt(kp.public(), &key_point, &mut rng);

        let lp = [9u8; 32];
        let f = blinding_factor(&master, "Age", &lp, 1234);
        let blinded = blind(&ct, &f);
        assert!(!blinded.decrypt(kp.secret()).equals(&key_point));
        let back = unblind(&blinded, &f);
        assert!(back.decrypt(kp.secret()).equals(&key_point));
    }

    #[test]
    fn factor_depends_on_cell() {
        let mut rng = thread_rng();
        let master = MasterSecret::generate(&mut rng);
        let a = blinding_factor(&master, "Age", &[1u8; 32], 1);
        let b = blinding_factor(&master, "Age", &[2u8; 32], 1);
        let c = blinding_factor(&master, "Weight", &[1u8; 32], 1);
        let d = blinding_factor(&master, "Age", &[1u8; 32], 2);
        assert!(!a.equals(&b));
        assert!(!a.equals(&c));
        assert!(!a.equals(&d));
    }
}
