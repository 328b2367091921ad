//! # Field Arithmetic mod 2^255 - 19
//!
//! Ten-limb signed radix-25.5 representation. Limb `i` carries
//! `25 + (i % 2 == 0)` bits; products accumulate in `i64`.
//!
//! All operations are branch-free with respect to operand values. Inputs to
//! `mul`/`square` must keep every limb below `1.65 * 2^26`.

use crate::constants;

/// An element of the field Z/(2^255 - 19).
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldElement(pub(crate) [i32; 10]);

#[inline]
fn load_3(s: &[u8]) -> i64 {
    (s[0] as i64) | ((s[1] as i64) << 8) | ((s[2] as i64) << 16)
}

#[inline]
fn load_4(s: &[u8]) -> i64 {
    (s[0] as i64) | ((s[1] as i64) << 8) | ((s[2] as i64) << 16) | ((s[3] as i64) << 24)
}

/// Constant-time byte-slice equality; both slices must have the same length.
pub(crate) fn bytes_eq_ct(a: &[u8], b: &[u8]) -> bool {
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

impl FieldElement {
    pub const ZERO: FieldElement = FieldElement([0; 10]);
    pub const ONE: FieldElement = FieldElement([1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    pub const TWO: FieldElement = FieldElement([2, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    pub const M_ONE: FieldElement = FieldElement([
        // -1 = p - 1 in reduced limb form: 2^255 - 20
        0x3ffffec, 0x1ffffff, 0x3ffffff, 0x1ffffff, 0x3ffffff, 0x1ffffff, 0x3ffffff, 0x1ffffff,
        0x3ffffff, 0x1ffffff,
    ]);

    /// Square root of -1 (computed once at load time).
    pub fn sqrtm1() -> FieldElement {
        *constants::sqrtm1()
    }

    /// Negated square root of -1.
    pub fn msqrtm1() -> FieldElement {
        constants::sqrtm1().neg()
    }

    /// Embeds a small unsigned integer.
    pub fn from_u32(v: u32) -> FieldElement {
        let mut h = [0i32; 10];
        h[0] = (v & 0x3ffffff) as i32;
        h[1] = (v >> 26) as i32;
        FieldElement(h)
    }

    /// Parses 32 little-endian bytes; the top bit is ignored.
    pub fn unpack(s: &[u8; 32]) -> FieldElement {
        let mut h = [0i64; 10];
        h[0] = load_4(&s[0..4]);
        h[1] = load_3(&s[4..7]) << 6;
        h[2] = load_3(&s[7..10]) << 5;
        h[3] = load_3(&s[10..13]) << 3;
        h[4] = load_3(&s[13..16]) << 2;
        h[5] = load_4(&s[16..20]);
        h[6] = load_3(&s[20..23]) << 7;
        h[7] = load_3(&s[23..26]) << 5;
        h[8] = load_3(&s[26..29]) << 4;
        h[9] = (load_3(&s[29..32]) & 8388607) << 2;

        let carry = |h: &mut [i64; 10], i: usize| {
            let shift = 26 - (i & 1);
            let c = (h[i] + (1i64 << (shift - 1))) >> shift;
            if i == 9 {
                h[0] += c * 19;
            } else {
                h[i + 1] += c;
            }
            h[i] -= c << shift;
        };
        for &i in &[9, 1, 3, 5, 7, 0, 2, 4, 6, 8] {
            carry(&mut h, i);
        }

        let mut out = [0i32; 10];
        for i in 0..10 {
            out[i] = h[i] as i32;
        }
        FieldElement(out)
    }

    /// Serializes to 32 canonical little-endian bytes, value fully reduced
    /// and the top bit clear.
    pub fn pack(&self) -> [u8; 32] {
        let mut h = [0i64; 10];
        for i in 0..10 {
            h[i] = self.0[i] as i64;
        }

        let mut q = (19 * h[9] + (1i64 << 24)) >> 25;
        for i in 0..10 {
            let shift = 26 - (i & 1);
            q = (h[i] + q) >> shift;
        }
        // h + 19q is in [0, 2^255) exactly when h is in [-p, p); add 19q and
        // shave the excess off the top limb.
        h[0] += 19 * q;
        for i in 0..10 {
            let shift = 26 - (i & 1);
            let c = h[i] >> shift;
            if i < 9 {
                h[i + 1] += c;
            }
            h[i] -= c << shift;
        }

        let mut s = [0u8; 32];
        s[0] = h[0] as u8;
        s[1] = (h[0] >> 8) as u8;
        s[2] = (h[0] >> 16) as u8;
        s[3] = ((h[0] >> 24) | (h[1] << 2)) as u8;
        s[4] = (h[1] >> 6) as u8;
        s[5] = (h[1] >> 14) as u8;
        s[6] = ((h[1] >> 22) | (h[2] << 3)) as u8;
        s[7] = (h[2] >> 5) as u8;
        s[8] = (h[2] >> 13) as u8;
        s[9] = ((h[2] >> 21) | (h[3] << 5)) as u8;
        s[10] = (h[3] >> 3) as u8;
        s[11] = (h[3] >> 11) as u8;
        s[12] = ((h[3] >> 19) | (h[4] << 6)) as u8;
        s[13] = (h[4] >> 2) as u8;
        s[14] = (h[4] >> 10) as u8;
        s[15] = (h[4] >> 18) as u8;
        s[16] = h[5] as u8;
        s[17] = (h[5] >> 8) as u8;
        s[18] = (h[5] >> 16) as u8;
        s[19] = ((h[5] >> 24) | (h[6] << 1)) as u8;
        s[20] = (h[6] >> 7) as u8;
        s[21] = (h[6] >> 15) as u8;
        s[22] = ((h[6] >> 23) | (h[7] << 3)) as u8;
        s[23] = (h[7] >> 5) as u8;
        s[24] = (h[7] >> 13) as u8;
        s[25] = ((h[7] >> 21) | (h[8] << 4)) as u8;
        s[26] = (h[8] >> 4) as u8;
        s[27] = (h[8] >> 12) as u8;
        s[28] = ((h[8] >> 20) | (h[9] << 6)) as u8;
        s[29] = (h[9] >> 2) as u8;
        s[30] = (h[9] >> 10) as u8;
        s[31] = (h[9] >> 18) as u8;
        s
    }

    pub fn add(&self, rhs: &FieldElement) -> FieldElement {
        let mut h = [0i32; 10];
        for i in 0..10 {
            h[i] = self.0[i] + rhs.0[i];
        }
        FieldElement(h)
    }

    pub fn sub(&self, rhs: &FieldElement) -> FieldElement {
        let mut h = [0i32; 10];
        for i in 0..10 {
            h[i] = self.0[i] - rhs.0[i];
        }
        FieldElement(h)
    }

    pub fn neg(&self) -> FieldElement {
        let mut h = [0i32; 10];
        for i in 0..10 {
            h[i] = -self.0[i];
        }
        FieldElement(h)
    }

    fn combine(mut h: [i64; 10]) -> FieldElement {
        let carry = |h: &mut [i64; 10], i: usize| {
            let shift = 26 - (i & 1);
            let c = (h[i] + (1i64 << (shift - 1))) >> shift;
            if i == 9 {
                h[0] += c * 19;
            } else {
                h[i + 1] += c;
            }
            h[i] -= c << shift;
        };
        for &i in &[0, 4, 1, 5, 2, 6, 3, 7, 4, 8, 5, 9, 0] {
            carry(&mut h, i);
        }
        let mut out = [0i32; 10];
        for i in 0..10 {
            out[i] = h[i] as i32;
        }
        FieldElement(out)
    }

    pub fn mul(&self, rhs: &FieldElement) -> FieldElement {
        let f = &self.0;
        let g = &rhs.0;
        let mut h = [0i64; 10];
        for i in 0..10 {
            for j in 0..10 {
                // Odd-odd limb pairs straddle a half-bit boundary; wrapped
                // products pick up the 19 from 2^255 = 19 (mod p).
                let mut m = (f[i] as i64) * (g[j] as i64);
                if i & 1 == 1 && j & 1 == 1 {
                    m *= 2;
                }
                if i + j >= 10 {
                    m *= 19;
                }
                h[(i + j) % 10] += m;
            }
        }
        FieldElement::combine(h)
    }

    pub fn square(&self) -> FieldElement {
        self.mul(self)
    }

    /// Computes `2 * self^2`.
    pub fn square_double(&self) -> FieldElement {
        let s = self.square();
        s.add(&s)
    }

    /// Branch-free conditional assignment: `self = other` iff `b == 1`.
    pub fn cmov(&mut self, other: &FieldElement, b: u8) {
        let mask = -(b as i32);
        for i in 0..10 {
            self.0[i] ^= mask & (self.0[i] ^ other.0[i]);
        }
    }

    /// Multiplicative inverse via a fixed addition chain for `x^(p-2)`;
    /// maps zero to zero.
    pub fn invert(&self) -> FieldElement {
        let z = self;
        let mut t0 = z.square(); // 2
        let mut t1 = t0.square(); // 4
        t1 = t1.square(); // 8
        t1 = z.mul(&t1); // 9
        t0 = t0.mul(&t1); // 11
        let mut t2 = t0.square(); // 22
        t1 = t1.mul(&t2); // 31 = 2^5 - 1
        t2 = t1.square();
        for _ in 1..5 {
            t2 = t2.square();
        }
        t1 = t2.mul(&t1); // 2^10 - 1
        t2 = t1.square();
        for _ in 1..10 {
            t2 = t2.square();
        }
        t2 = t2.mul(&t1); // 2^20 - 1
        let mut t3 = t2.square();
        for _ in 1..20 {
            t3 = t3.square();
        }
        t2 = t3.mul(&t2); // 2^40 - 1
        t2 = t2.square();
        for _ in 1..10 {
            t2 = t2.square();
        }
        t1 = t2.mul(&t1); // 2^50 - 1
        t2 = t1.square();
        for _ in 1..50 {
            t2 = t2.square();
        }
        t2 = t2.mul(&t1); // 2^100 - 1
        t3 = t2.square();
        for _ in 1..100 {
            t3 = t3.square();
        }
        t2 = t3.mul(&t2); // 2^200 - 1
        t2 = t2.square();
        for _ in 1..50 {
            t2 = t2.square();
        }
        t1 = t2.mul(&t1); // 2^250 - 1
        t1 = t1.square();
        for _ in 1..5 {
            t1 = t1.square();
        }
        t1.mul(&t0) // 2^255 - 21 = p - 2
    }

    /// Computes `x^((p-5)/8) = x^(2^252 - 3)`.
    pub fn pow2523(&self) -> FieldElement {
        let z = self;
        let t = z.pow_2_250_minus_1();
        let mut t = t.square();
        t = t.square(); // 2^252 - 4
        t.mul(z) // 2^252 - 3
    }

    /// Computes `x^(2^250 - 1)`, the shared prefix of the exponentiation
    /// chains.
    fn pow_2_250_minus_1(&self) -> FieldElement {
        let z = self;
        let mut t0 = z.square(); // 2
        let mut t1 = t0.square(); // 4
        t1 = t1.square(); // 8
        t1 = z.mul(&t1); // 9
        t0 = t0.mul(&t1); // 11
        t0 = t0.square(); // 22
        t0 = t1.mul(&t0); // 31 = 2^5 - 1
        t1 = t0.square();
        for _ in 1..5 {
            t1 = t1.square();
        }
        t0 = t1.mul(&t0); // 2^10 - 1
        t1 = t0.square();
        for _ in 1..10 {
            t1 = t1.square();
        }
        t1 = t1.mul(&t0); // 2^20 - 1
        let mut t2 = t1.square();
        for _ in 1..20 {
            t2 = t2.square();
        }
        t1 = t2.mul(&t1); // 2^40 - 1
        t1 = t1.square();
        for _ in 1..10 {
            t1 = t1.square();
        }
        t0 = t1.mul(&t0); // 2^50 - 1
        t1 = t0.square();
        for _ in 1..50 {
            t1 = t1.square();
        }
        t1 = t1.mul(&t0); // 2^100 - 1
        t2 = t1.square();
        for _ in 1..100 {
            t2 = t2.square();
        }
        t1 = t2.mul(&t1); // 2^200 - 1
        t1 = t1.square();
        for _ in 1..50 {
            t1 = t1.square();
        }
        t1.mul(&t0) // 2^250 - 1
    }

    /// Computes `x^((p-1)/4) = x^(2^253 - 5)`. Applied to a non-residue this
    /// yields a square root of -1; used only to seed the lazy constants.
    pub(crate) fn pow_p_minus_1_over_4(&self) -> FieldElement {
        let z = self;
        let t = z.pow_2_250_minus_1();
        let mut t = t.square();
        t = t.square();
        t = t.square(); // 2^253 - 8
        let z3 = z.square().mul(z);
        t.mul(&z3) // 2^253 - 5
    }

    pub fn is_zero(&self) -> bool {
        bytes_eq_ct(&self.pack(), &[0u8; 32])
    }

    pub fn is_one(&self) -> bool {
        let mut one = [0u8; 32];
        one[0] = 1;
        bytes_eq_ct(&self.pack(), &one)
    }

    /// True when the canonical representative is odd.
    pub fn is_negative(&self) -> bool {
        self.pack()[0] & 1 == 1
    }

    pub fn is_eq(&self, other: &FieldElement) -> bool {
        bytes_eq_ct(&self.pack(), &other.pack())
    }

    /// `1/sqrt(x)`, or `1/sqrt(i*x)` when `x` is not a square; the boolean
    /// reports whether `x` was a square. Zero maps to zero and reports
    /// "not a square".
    pub fn invsqrti(&self) -> (FieldElement, bool) {
        let x = self;
        let den2 = x.square();
        let den3 = den2.mul(x);
        let den4 = den2.square();
        let den6 = den2.mul(&den4);
        let mut t = den6.mul(x); // x^7
        t = t.pow2523();
        t = t.mul(&den3);

        // case       A           B            C             D
        // t          1/sqrt(x)   -i/sqrt(x)   1/sqrt(i*x)   -i/sqrt(i*x)
        // chk        1           -1           -i            i
        // corr       1           i            1             i
        let mut chk = t.square();
        chk = chk.mul(x);

        let in_a = chk.is_one();
        let in_d = chk.is_eq(constants::sqrtm1());
        chk = chk.neg();
        let in_b = chk.is_one();

        let mut corr = FieldElement::ONE;
        corr.cmov(constants::sqrtm1(), (in_b | in_d) as u8);
        t = t.mul(&corr);

        (t, in_a | in_b)
    }

    /// `1/sqrt(x)` or `1/sqrt(i*x)`, without the square classification.
    pub fn invsqrt(&self) -> FieldElement {
        let (mut t, was_square) = {
            let x = self;
            let den2 = x.square();
            let den3 = den2.mul(x);
            let den4 = den2.square();
            let den6 = den2.mul(&den4);
            let mut t = den6.mul(x);
            t = t.pow2523();
            t = t.mul(&den3);
            let chk = t.square().mul(x);
            (t, chk.is_one())
        };
        let t2 = t.mul(constants::sqrtm1());
        t.cmov(&t2, (!was_square) as u8);
        t
    }

    /// `sqrt(x)` when `x` is a square; garbage otherwise.
    pub fn sqrt(&self) -> FieldElement {
        self.invsqrt().mul(self)
    }

    /// `sqrt(x)` or `sqrt(i*x)`; the boolean reports whether `x` was a
    /// square.
    pub fn sqrti(&self) -> (FieldElement, bool) {
        let (mut t, was_square) = self.invsqrti();
        let mut corr = FieldElement::ONE;
        corr.cmov(constants::sqrtm1(), (!was_square) as u8);
        t = t.mul(&corr);
        (t.mul(self), was_square)
    }

    /// The representative with even canonical form: `x` or `-x`.
    pub fn abs(&self) -> FieldElement {
        let mut r = *self;
        let neg = self.neg();
        r.cmov(&neg, self.is_negative() as u8);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fe(v: u32) -> FieldElement {
        FieldElement::from_u32(v)
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let mut bytes = [0u8; 32];
        for i in 0..32 {
            bytes[i] = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        bytes[31] &= 0x7f;
        let x = FieldElement::unpack(&bytes);
        assert_eq!(x.pack(), bytes);
    }

    #[test]
    fn unpack_ignores_top_bit() {
        let mut a = [0u8; 32];
        a[0] = 5;
        let mut b = a;
        b[31] |= 0x80;
        assert!(FieldElement::unpack(&a).is_eq(&FieldElement::unpack(&b)));
    }

    #[test]
    fn mul_commutes_and_distributes() {
        let a = fe(123456789);
        let b = fe(987654321);
        let c = fe(192837465);
        assert!(a.mul(&b).is_eq(&b.mul(&a)));
        let lhs = a.mul(&b.add(&c));
        let rhs = a.mul(&b).add(&a.mul(&c));
        assert!(lhs.is_eq(&rhs));
    }

    #[test]
    fn add_associates() {
        let a = fe(11111);
        let b = fe(22222);
        let c = fe(33333);
        assert!(a.add(&b).add(&c).is_eq(&a.add(&b.add(&c))));
    }

    #[test]
    fn invert_gives_one() {
        let a = fe(0xdeadbeef);
        assert!(a.mul(&a.invert()).is_one());
        assert!(FieldElement::ZERO.invert().is_zero());
    }

    #[test]
    fn minus_one_constant_matches() {
        assert!(FieldElement::M_ONE.is_eq(&FieldElement::ONE.neg()));
        assert!(FieldElement::M_ONE.add(&FieldElement::ONE).is_zero());
    }

    #[test]
    fn sqrtm1_squares_to_minus_one() {
        let i = FieldElement::sqrtm1();
        assert!(i.square().is_eq(&FieldElement::M_ONE));
        assert!(FieldElement::msqrtm1().square().is_eq(&FieldElement::M_ONE));
    }

    #[test]
    fn sqrt_of_square_is_plus_minus() {
        let a = fe(7777777);
        let sq = a.square();
        let (r, was_square) = sq.sqrti();
        assert!(was_square);
        assert!(r.is_eq(&a) || r.is_eq(&a.neg()));
    }

    #[test]
    fn invsqrti_classifies_residues() {
        // 4 is a square; 2 is not (p = 5 mod 8).
        let (_, sq) = fe(4).invsqrti();
        assert!(sq);
        let (_, nsq) = fe(2).invsqrti();
        assert!(!nsq);
    }

    #[test]
    fn invsqrt_inverts_square_roots() {
        let a = fe(1234321);
        let sq = a.square();
        let r = sq.invsqrt();
        // r = 1/sqrt(a^2), so r^2 * a^2 == 1.
        assert!(r.square().mul(&sq).is_one());
    }

    #[test]
    fn abs_is_even() {
        let a = fe(987654321).neg();
        assert!(!a.abs().is_negative());
    }

    #[test]
    fn cmov_selects() {
        let mut a = fe(1);
        let b = fe(2);
        a.cmov(&b, 0);
        assert!(a.is_one());
        a.cmov(&b, 1);
        assert!(a.is_eq(&b));
    }
}
