//! # PEP Curve - Curve25519 Arithmetic
//!
//! Constant-time field, group and scalar arithmetic over Curve25519 in its
//! twisted Edwards form, as required by the polymorphic-pseudonym layer.
//!
//! ## Components
//!
//! | Module | Contents |
//! |--------|----------|
//! | `fe` | Field mod 2^255 - 19: 10-limb arithmetic, roots, inverse roots |
//! | `ge` | Edwards group: add/double, CT and var-time scalar mult, hash-to-curve |
//! | `scalar` | Integers mod the group order, window and w-NAF recodings |
//! | `constants` | Curve constants and the base-point table, built at load |
//!
//! ## Security Properties
//!
//! - All non-`vartime` operations are branch-free with respect to secrets.
//! - Every externally received point is checked for curve and prime-order
//!   subgroup membership at `unpack`.
//! - Table lookups in constant-time scalar multiplication read entire rows
//!   through masked conditional moves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod errors;
pub mod fe;
pub mod ge;
pub mod scalar;

// Re-exports
pub use errors::CurveError;
pub use fe::FieldElement;
pub use ge::GroupElement;
pub use scalar::{Scalar, GROUP_ORDER};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
