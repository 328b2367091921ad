//! # Group Arithmetic on the Twisted Edwards Curve
//!
//! Points on `-x^2 + y^2 = 1 + d x^2 y^2` in extended coordinates
//! `(X, Y, Z, T)` with `T = XY/Z`, using the Hisil-Wong-Carter-Dawson
//! formulas through completed (`P1P1`) and projective (`P2`) intermediates.
//!
//! Constant-time scalar multiplication selects table entries by masked
//! conditional moves; the variable-time routines (w-NAF based) are for
//! public inputs only.

use sha2::{Digest, Sha512};

use crate::constants;
use crate::errors::CurveError;
use crate::fe::FieldElement;
use crate::scalar::{Scalar, GROUP_ORDER};

/// A point on the curve, held in extended coordinates. Non-neutral values
/// at rest are on the curve and in the prime-order subgroup.
#[derive(Clone, Copy, Debug)]
pub struct GroupElement {
    pub(crate) x: FieldElement,
    pub(crate) y: FieldElement,
    pub(crate) z: FieldElement,
    pub(crate) t: FieldElement,
}

/// Completed point; the output form of the addition formulas.
struct Completed {
    x: FieldElement,
    y: FieldElement,
    z: FieldElement,
    t: FieldElement,
}

/// Projective point without the extended coordinate; cheap to double.
struct Projective {
    x: FieldElement,
    y: FieldElement,
    z: FieldElement,
}

/// Cached addend form: `(Y+X, Y-X, Z, 2dT)`.
#[derive(Clone, Copy)]
struct Cached {
    y_plus_x: FieldElement,
    y_minus_x: FieldElement,
    z: FieldElement,
    t2d: FieldElement,
}

/// Affine Niels form: `(y+x, y-x, 2dxy)`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Niels {
    y_plus_x: FieldElement,
    y_minus_x: FieldElement,
    xy2d: FieldElement,
}

impl Niels {
    const NEUTRAL: Niels = Niels {
        y_plus_x: FieldElement::ONE,
        y_minus_x: FieldElement::ONE,
        xy2d: FieldElement::ZERO,
    };

    fn cmov(&mut self, other: &Niels, b: u8) {
        self.y_plus_x.cmov(&other.y_plus_x, b);
        self.y_minus_x.cmov(&other.y_minus_x, b);
        self.xy2d.cmov(&other.xy2d, b);
    }

    /// Branch-free negation when `b == 1` (swaps the sum/difference pair
    /// and flips the product term).
    fn cneg(&mut self, b: u8) {
        let mut flipped = Niels {
            y_plus_x: self.y_minus_x,
            y_minus_x: self.y_plus_x,
            xy2d: self.xy2d.neg(),
        };
        flipped.cmov(self, 1 - b);
        *self = flipped;
    }
}

/// `1` iff `b == c`, branch-free.
#[inline]
fn equal_i8(b: i8, c: i8) -> u8 {
    let x = (b as u8) ^ (c as u8);
    let y = (x as u32).wrapping_sub(1);
    (y >> 31) as u8
}

/// `1` iff `b < 0`, branch-free.
#[inline]
fn negative_i8(b: i8) -> u8 {
    ((b as i64 as u64) >> 63) as u8
}

/// `|b|`, branch-free.
#[inline]
fn abs_i8(b: i8) -> i8 {
    let mask = b >> 7;
    (b ^ mask).wrapping_sub(mask)
}

impl Completed {
    fn to_extended(&self) -> GroupElement {
        GroupElement {
            x: self.x.mul(&self.t),
            y: self.y.mul(&self.z),
            z: self.z.mul(&self.t),
            t: self.x.mul(&self.y),
        }
    }
}

impl Projective {
    fn double(&self) -> Completed {
        let a = self.x.square();
        let b = self.y.square();
        let c = self.z.square_double();
        let d = a.neg();
        let mut x = self.x.add(&self.y);
        x = x.square();
        x = x.sub(&a);
        x = x.sub(&b);
        let z = d.add(&b);
        let t = z.sub(&c);
        let y = d.sub(&b);
        Completed { x, y, z, t }
    }
}

impl GroupElement {
    pub const NEUTRAL: GroupElement = GroupElement {
        x: FieldElement::ZERO,
        y: FieldElement::ONE,
        z: FieldElement::ONE,
        t: FieldElement::ZERO,
    };

    /// The curve base point.
    pub fn base() -> &'static GroupElement {
        constants::base()
    }

    fn to_cached(&self) -> Cached {
        Cached {
            y_plus_x: self.y.add(&self.x),
            y_minus_x: self.y.sub(&self.x),
            z: self.z,
            t2d: self.t.mul(constants::ed_d2()),
        }
    }

    fn to_projective(&self) -> Projective {
        Projective {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }

    /// Affine Niels form; one field inversion.
    fn to_niels(&self) -> Niels {
        let zinv = self.z.invert();
        let x = self.x.mul(&zinv);
        let y = self.y.mul(&zinv);
        Niels {
            y_plus_x: y.add(&x),
            y_minus_x: y.sub(&x),
            xy2d: x.mul(&y).mul(constants::ed_d2()),
        }
    }

    fn add_cached(&self, q: &Cached) -> Completed {
        let a = self.y.sub(&self.x).mul(&q.y_minus_x);
        let b = self.y.add(&self.x).mul(&q.y_plus_x);
        let c = self.t.mul(&q.t2d);
        let d = self.z.mul(&q.z);
        let d = d.add(&d);
        Completed {
            x: b.sub(&a),
            y: b.add(&a),
            z: d.add(&c),
            t: d.sub(&c),
        }
    }

    fn sub_cached(&self, q: &Cached) -> Completed {
        let a = self.y.sub(&self.x).mul(&q.y_plus_x);
        let b = self.y.add(&self.x).mul(&q.y_minus_x);
        let c = self.t.mul(&q.t2d);
        let d = self.z.mul(&q.z);
        let d = d.add(&d);
        Completed {
            x: b.sub(&a),
            y: b.add(&a),
            z: d.sub(&c),
            t: d.add(&c),
        }
    }

    fn add_niels(&self, n: &Niels) -> Completed {
        let a = self.y.sub(&self.x).mul(&n.y_minus_x);
        let b = self.y.add(&self.x).mul(&n.y_plus_x);
        let c = self.t.mul(&n.xy2d);
        let d = self.z.add(&self.z);
        Completed {
            x: b.sub(&a),
            y: b.add(&a),
            z: d.add(&c),
            t: d.sub(&c),
        }
    }

    pub fn add(&self, other: &GroupElement) -> GroupElement {
        self.add_cached(&other.to_cached()).to_extended()
    }

    pub fn sub(&self, other: &GroupElement) -> GroupElement {
        self.sub_cached(&other.to_cached()).to_extended()
    }

    pub fn double(&self) -> GroupElement {
        self.to_projective().double().to_extended()
    }

    pub fn negate(&self) -> GroupElement {
        GroupElement {
            x: self.x.neg(),
            y: self.y,
            z: self.z,
            t: self.t.neg(),
        }
    }

    /// Multiplies by the cofactor 8.
    pub fn mul_by_cofactor(&self) -> GroupElement {
        self.double().double().double()
    }

    pub fn is_neutral(&self) -> bool {
        self.x.is_zero() & self.y.is_eq(&self.z)
    }

    pub fn equals(&self, other: &GroupElement) -> bool {
        let a = self.x.mul(&other.z).is_eq(&other.x.mul(&self.z));
        let b = self.y.mul(&other.z).is_eq(&other.y.mul(&self.z));
        a & b
    }

    fn cmov(&mut self, other: &GroupElement, b: u8) {
        self.x.cmov(&other.x, b);
        self.y.cmov(&other.y, b);
        self.z.cmov(&other.z, b);
        self.t.cmov(&other.t, b);
    }

    /// Constant-time selection of `pre[|b|]` with conditional negation,
    /// `b` in `[-8, 8]`.
    fn select(pre: &[GroupElement; 9], b: i8) -> GroupElement {
        let neg = negative_i8(b);
        let babs = abs_i8(b);
        let mut t = pre[0];
        for (j, entry) in pre.iter().enumerate().skip(1) {
            t.cmov(entry, equal_i8(babs, j as i8));
        }
        let mut negated = t.negate();
        negated.cmov(&t, 1 - neg);
        t = negated;
        t
    }

    /// Constant-time scalar multiplication (width-4 fixed window).
    pub fn scalar_mult(&self, s: &Scalar) -> GroupElement {
        let digits = s.window4();
        let mut pre = [GroupElement::NEUTRAL; 9];
        pre[1] = *self;
        for j in 2..9 {
            pre[j] = pre[j - 1].add(self);
        }
        let mut r = GroupElement::NEUTRAL;
        for i in (0..64).rev() {
            for _ in 0..4 {
                r = r.double();
            }
            let t = GroupElement::select(&pre, digits[i]);
            r = r.add(&t);
        }
        r
    }

    /// Constant-time base-point multiplication via the precomputed table.
    pub fn scalar_mult_base(s: &Scalar) -> GroupElement {
        constants::base_table().mult(s)
    }

    /// Variable-time scalar multiplication. Public inputs only.
    pub fn scalar_mult_vartime(&self, s: &Scalar) -> GroupElement {
        let naf = s.wnaf5();
        let pre = self.odd_multiples();
        let mut r = GroupElement::NEUTRAL;
        let mut started = false;
        for i in (0..256).rev() {
            if started {
                r = r.double();
            }
            let d = naf[i];
            if d > 0 {
                r = r.add_cached(&pre[(d as usize) / 2]).to_extended();
                started = true;
            } else if d < 0 {
                r = r.sub_cached(&pre[((-d) as usize) / 2]).to_extended();
                started = true;
            }
        }
        r
    }

    /// Variable-time multi-scalar multiplication: `sum(s_i * p_i)`. Public
    /// inputs only.
    pub fn multiscalar_mult_vartime(scalars: &[Scalar], points: &[GroupElement]) -> GroupElement {
        debug_assert_eq!(scalars.len(), points.len());
        let nafs: Vec<[i8; 256]> = scalars.iter().map(|s| s.wnaf5()).collect();
        let tables: Vec<[Cached; 8]> = points.iter().map(|p| p.odd_multiples()).collect();
        let mut r = GroupElement::NEUTRAL;
        for i in (0..256).rev() {
            r = r.double();
            for (naf, table) in nafs.iter().zip(tables.iter()) {
                let d = naf[i];
                if d > 0 {
                    r = r.add_cached(&table[(d as usize) / 2]).to_extended();
                } else if d < 0 {
                    r = r.sub_cached(&table[((-d) as usize) / 2]).to_extended();
                }
            }
        }
        r
    }

    /// Cached odd multiples `[P, 3P, 5P, ..., 15P]`.
    fn odd_multiples(&self) -> [Cached; 8] {
        let p2 = self.double();
        let mut pre = [self.to_cached(); 8];
        let mut cur = *self;
        for j in 1..8 {
            cur = cur.add(&p2);
            pre[j] = cur.to_cached();
        }
        pre
    }

    /// Checks membership of the prime-order subgroup by multiplying by the
    /// group order. Variable-time; callers pass public points.
    pub fn is_in_prime_order_subgroup(&self) -> bool {
        let mut r = GroupElement::NEUTRAL;
        for i in (0..253).rev() {
            r = r.double();
            if (GROUP_ORDER[i >> 3] >> (i & 7)) & 1 == 1 {
                r = r.add(self);
            }
        }
        r.is_neutral()
    }

    /// Serializes to 32 bytes: the affine `y` with the sign of `x` in the
    /// top bit.
    pub fn pack(&self) -> [u8; 32] {
        let zinv = self.z.invert();
        let x = self.x.mul(&zinv);
        let y = self.y.mul(&zinv);
        let mut s = y.pack();
        s[31] |= (x.is_negative() as u8) << 7;
        s
    }

    /// Parses a packed point, recovering `x` from `y` and validating curve
    /// and subgroup membership.
    pub fn unpack(bytes: &[u8; 32]) -> Result<GroupElement, CurveError> {
        let y = FieldElement::unpack(bytes);
        let sign = (bytes[31] >> 7) & 1;
        let y2 = y.square();
        let num = y2.sub(&FieldElement::ONE);
        let den = constants::ed_d().mul(&y2).add(&FieldElement::ONE);

        let (root, was_square) = num.mul(&den).invsqrti();
        let mut x = root.mul(&num);
        if num.is_zero() {
            if sign == 1 {
                return Err(CurveError::InvalidPoint);
            }
            x = FieldElement::ZERO;
        } else if !was_square {
            return Err(CurveError::InvalidPoint);
        }
        if x.is_negative() as u8 != sign {
            x = x.neg();
        }

        let p = GroupElement {
            x,
            y,
            z: FieldElement::ONE,
            t: x.mul(&y),
        };
        if !p.is_in_prime_order_subgroup() {
            return Err(CurveError::InvalidPoint);
        }
        Ok(p)
    }

    /// Hashes an arbitrary string onto the prime-order subgroup:
    /// SHA-512, reduction into the field, Elligator-2, cofactor clearing.
    pub fn hash_from_string(msg: &[u8]) -> GroupElement {
        let digest = Sha512::digest(msg);
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&digest);
        let r = fe_from_wide(&wide);
        elligator(&r).mul_by_cofactor()
    }
}

/// Reduces a 512-bit little-endian value into the field:
/// `lo + 19*b255 + 38*hi + 722*b511` (since `2^255 = 19 mod p`).
fn fe_from_wide(h: &[u8; 64]) -> FieldElement {
    let mut lo = [0u8; 32];
    let mut hi = [0u8; 32];
    lo.copy_from_slice(&h[..32]);
    hi.copy_from_slice(&h[32..]);
    let b_lo = (h[31] >> 7) as u32;
    let b_hi = (h[63] >> 7) as u32;
    let lo = FieldElement::unpack(&lo);
    let hi = FieldElement::unpack(&hi);
    lo.add(&FieldElement::from_u32(19 * b_lo))
        .add(&hi.mul(&FieldElement::from_u32(38)))
        .add(&FieldElement::from_u32(722 * b_hi))
}

/// Elligator-2 onto the curve (before cofactor clearing). Exceptional
/// inputs collapse to the neutral element.
fn elligator(r: &FieldElement) -> GroupElement {
    let a = constants::mont_a();
    let rr = r.square();
    let den = FieldElement::ONE.add(&rr.add(&rr)); // 1 + 2r^2
    let d = a.neg().mul(&den.invert());

    // e = d^3 + A d^2 + d decides which of {d, -d - A} is the Montgomery x.
    let d2 = d.square();
    let e = d.mul(&d2).add(&a.mul(&d2)).add(&d);
    let (_, was_square) = e.invsqrti();

    let mut u = d;
    let alt = d.neg().sub(a);
    u.cmov(&alt, (!was_square) as u8);

    let u2 = u.square();
    let e2 = u.mul(&u2).add(&a.mul(&u2)).add(&u);
    let v = e2.sqrt();

    // Montgomery (u, v) -> Edwards (x, y).
    let x = constants::magic().mul(&u).mul(&v.invert());
    let y_den = u.add(&FieldElement::ONE);
    let y = u.sub(&FieldElement::ONE).mul(&y_den.invert());

    let mut p = GroupElement {
        x,
        y,
        z: FieldElement::ONE,
        t: x.mul(&y),
    };
    let valid = v.square().is_eq(&e2) & !v.is_zero() & !y_den.is_zero();
    p.cmov(&GroupElement::NEUTRAL, (!valid) as u8);
    p
}

/// Precomputed multiplication table for a fixed point: 64 width-4 digit
/// positions, 8 positive multiples each, in affine Niels form.
pub struct NielsTable {
    rows: Vec<[Niels; 8]>,
}

impl NielsTable {
    /// Builds the table `rows[i][j] = (j+1) * 16^i * P`.
    pub fn for_point(p: &GroupElement) -> NielsTable {
        let mut rows = Vec::with_capacity(64);
        let mut block = *p;
        for _ in 0..64 {
            let mut row = [Niels::NEUTRAL; 8];
            let mut m = block;
            for j in 0..8 {
                row[j] = m.to_niels();
                if j < 7 {
                    m = m.add(&block);
                }
            }
            rows.push(row);
            block = block.double().double().double().double();
        }
        NielsTable { rows }
    }

    /// Constant-time selection of the digit-`b` entry of row `i`.
    fn select(&self, i: usize, b: i8) -> Niels {
        let neg = negative_i8(b);
        let babs = abs_i8(b);
        let mut n = Niels::NEUTRAL;
        for (j, entry) in self.rows[i].iter().enumerate() {
            n.cmov(entry, equal_i8(babs, (j + 1) as i8));
        }
        n.cneg(neg);
        n
    }

    /// Constant-time multiplication of the table's point by `s`.
    pub fn mult(&self, s: &Scalar) -> GroupElement {
        let digits = s.window4();
        let mut r = GroupElement::NEUTRAL;
        for (i, &d) in digits.iter().enumerate() {
            let n = self.select(i, d);
            r = r.add_niels(&n).to_extended();
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(v: u64) -> Scalar {
        let mut b = [0u8; 32];
        b[..8].copy_from_slice(&v.to_le_bytes());
        Scalar::unpack(&b)
    }

    #[test]
    fn base_point_unpacks() {
        let b = GroupElement::base();
        assert!(!b.is_neutral());
        assert_eq!(b.pack(), constants::BASE_POINT_BYTES);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let p = GroupElement::base().scalar_mult_vartime(&scalar(12345));
        let packed = p.pack();
        let q = GroupElement::unpack(&packed).unwrap();
        assert!(p.equals(&q));
        assert_eq!(q.pack(), packed);
    }

    #[test]
    fn addition_commutes() {
        let b = GroupElement::base();
        let p = b.scalar_mult_vartime(&scalar(7));
        let q = b.scalar_mult_vartime(&scalar(11));
        assert!(p.add(&q).equals(&q.add(&p)));
    }

    #[test]
    fn addition_associates() {
        let b = GroupElement::base();
        let p = b.scalar_mult_vartime(&scalar(3));
        let q = b.scalar_mult_vartime(&scalar(5));
        let r = b.scalar_mult_vartime(&scalar(9));
        assert!(p.add(&q).add(&r).equals(&p.add(&q.add(&r))));
    }

    #[test]
    fn neutral_is_identity() {
        let p = GroupElement::base().scalar_mult_vartime(&scalar(42));
        assert!(p.add(&GroupElement::NEUTRAL).equals(&p));
        assert!(p.sub(&p).is_neutral());
        assert!(p.add(&p.negate()).is_neutral());
    }

    #[test]
    fn double_matches_add() {
        let p = GroupElement::base().scalar_mult_vartime(&scalar(99));
        assert!(p.double().equals(&p.add(&p)));
    }

    #[test]
    fn scalar_mult_variants_agree() {
        let s = scalar(0xdead_beef_cafe);
        let b = GroupElement::base();
        let ct = b.scalar_mult(&s);
        let vt = b.scalar_mult_vartime(&s);
        let tb = GroupElement::scalar_mult_base(&s);
        assert!(ct.equals(&vt));
        assert!(ct.equals(&tb));
    }

    #[test]
    fn small_multiples_agree() {
        let b = GroupElement::base();
        let two = b.add(b);
        assert!(b.scalar_mult(&scalar(2)).equals(&two));
        let three = two.add(b);
        assert!(GroupElement::scalar_mult_base(&scalar(3)).equals(&three));
    }

    #[test]
    fn multiscalar_matches_linear_combination() {
        let b = GroupElement::base();
        let p = b.scalar_mult_vartime(&scalar(17));
        let a = scalar(1000);
        let c = scalar(31);
        // a*B + c*(17B) == (a + 17c)*B
        let lhs = GroupElement::multiscalar_mult_vartime(&[a, c], &[*b, p]);
        let expected = a.add(&c.mul(&scalar(17)));
        assert!(lhs.equals(&GroupElement::scalar_mult_base(&expected)));
    }

    #[test]
    fn scalar_mult_respects_order() {
        let b = GroupElement::base();
        assert!(b.is_in_prime_order_subgroup());
        assert!(b.scalar_mult_vartime(&Scalar::ZERO).is_neutral());
    }

    #[test]
    fn hash_to_curve_lands_in_subgroup() {
        let p = GroupElement::hash_from_string(b"pep test input");
        let q = GroupElement::hash_from_string(b"pep test input");
        assert!(p.equals(&q));
        assert!(p.is_in_prime_order_subgroup());
        let r = GroupElement::hash_from_string(b"other input");
        assert!(!p.equals(&r));
    }

    #[test]
    fn unpack_rejects_low_order_points() {
        // y = -1 encodes the order-2 point (0, -1).
        let mut order2 = [0xffu8; 32];
        order2[0] = 0xec;
        order2[31] = 0x7f;
        assert!(GroupElement::unpack(&order2).is_err());
        // y = 0 encodes an order-4 point (sqrt(-1), 0).
        let order4 = [0u8; 32];
        assert!(GroupElement::unpack(&order4).is_err());
    }

    #[test]
    fn unpack_accepts_neutral() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        let p = GroupElement::unpack(&bytes).unwrap();
        assert!(p.is_neutral());
    }

    #[test]
    fn distributive_over_add() {
        let s = scalar(1234);
        let t = scalar(5678);
        let lhs = GroupElement::scalar_mult_base(&s.add(&t));
        let rhs =
            GroupElement::scalar_mult_base(&s).add(&GroupElement::scalar_mult_base(&t));
        assert!(lhs.equals(&rhs));
    }
}
