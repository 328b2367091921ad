//! # Crypto Error Types

use thiserror::Error;

/// Errors from the ElGamal and translation layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PepCryptoError {
    /// A packed ciphertext or point failed to parse.
    #[error("invalid ciphertext encoding")]
    InvalidCiphertext,

    /// A translation proof failed verification.
    #[error("translation proof rejected")]
    ProofRejected,
}

impl From<pep_curve::CurveError> for PepCryptoError {
    fn from(_: pep_curve::CurveError) -> Self {
        PepCryptoError::InvalidCiphertext
    }
}
