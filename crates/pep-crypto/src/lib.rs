//! # PEP Crypto - Polymorphic Encryption Primitives
//!
//! ElGamal over the Curve25519 Edwards group plus the PEP-specific
//! operations on top of it.
//!
//! ## Components
//!
//! | Module | Contents |
//! |--------|----------|
//! | `elgamal` | Ciphertext triple, rerandomize / rekey / reshuffle |
//! | `proofs` | Generalized Chaum-Pedersen discrete-log-equality NIZKs |
//! | `translator` | Certified pseudonym translation and local pseudonyms |
//! | `blinding` | Deterministic per-cell data-key blinding |
//! | `keys` | Key pairs, master secrets, hash-to-scalar |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blinding;
pub mod elgamal;
pub mod errors;
pub mod keys;
pub mod proofs;
pub mod translator;

// Re-exports
pub use elgamal::{ElGamal, PackedElGamal};
pub use errors::PepCryptoError;
pub use keys::{hash_to_scalar, KeyPair, MasterSecret};
pub use proofs::DlEqProof;
pub use translator::{
    local_pseudonym, verify_translation, KeyDomain, TranslationProof, TranslationVerifiers,
    Translator,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
