//! # Curve Constants
//!
//! The Ed25519 curve constants (`d`, `2d`, `sqrt(-1)`, the Montgomery `A`
//! and the Montgomery-to-Edwards scaling root) together with the base point
//! and its multiplication table. Everything is derived arithmetically once
//! at first use; no limb tables are hardcoded.

use once_cell::sync::Lazy;

use crate::fe::FieldElement;
use crate::ge::{GroupElement, NielsTable};

/// Canonical encoding of the Ed25519 base point (y = 4/5, x even).
pub const BASE_POINT_BYTES: [u8; 32] = [
    0x58, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66,
];

// 2 is a non-residue mod p (p = 5 mod 8), so 2^((p-1)/4) is a root of -1.
static SQRTM1: Lazy<FieldElement> = Lazy::new(|| FieldElement::TWO.pow_p_minus_1_over_4());

// d = -121665/121666
static ED_D: Lazy<FieldElement> = Lazy::new(|| {
    FieldElement::from_u32(121665)
        .neg()
        .mul(&FieldElement::from_u32(121666).invert())
});

static ED_D2: Lazy<FieldElement> = Lazy::new(|| ed_d().add(ed_d()));

// Montgomery curve coefficient for the Elligator map.
static MONT_A: Lazy<FieldElement> = Lazy::new(|| FieldElement::from_u32(486662));

// sqrt(-486664), the Montgomery-to-Edwards x scaling factor.
static MAGIC: Lazy<FieldElement> = Lazy::new(|| {
    let (root, _) = FieldElement::from_u32(486664).neg().sqrti();
    root
});

static BASE: Lazy<GroupElement> = Lazy::new(|| {
    GroupElement::unpack(&BASE_POINT_BYTES).expect("base point encoding is valid")
});

static BASE_TABLE: Lazy<NielsTable> = Lazy::new(|| NielsTable::for_point(base()));

pub(crate) fn sqrtm1() -> &'static FieldElement {
    &SQRTM1
}

pub(crate) fn ed_d() -> &'static FieldElement {
    &ED_D
}

pub(crate) fn ed_d2() -> &'static FieldElement {
    &ED_D2
}

pub(crate) fn mont_a() -> &'static FieldElement {
    &MONT_A
}

pub(crate) fn magic() -> &'static FieldElement {
    &MAGIC
}

/// The Ed25519 base point.
pub fn base() -> &'static GroupElement {
    &BASE
}

/// The precomputed base-point multiplication table.
pub(crate) fn base_table() -> &'static NielsTable {
    &BASE_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_squares_back() {
        let m = magic();
        assert!(m
            .square()
            .is_eq(&FieldElement::from_u32(486664).neg()));
    }

    #[test]
    fn base_point_encoding_matches_rfc_constant() {
        let expected = hex::decode(format!("58{}", "66".repeat(31))).unwrap();
        assert_eq!(&BASE_POINT_BYTES[..], &expected[..]);
    }

    #[test]
    fn d_matches_fraction() {
        // d * 121666 == -121665
        let lhs = ed_d().mul(&FieldElement::from_u32(121666));
        assert!(lhs.is_eq(&FieldElement::from_u32(121665).neg()));
    }
}
