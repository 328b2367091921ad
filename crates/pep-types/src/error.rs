//! # Error Taxonomy
//!
//! The network-portable error model: every handler in the core returns
//! either a success value or a single `PepError`, which is re-raised at the
//! caller with the same kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The portable error kinds of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input: duplicate pseudonyms, unknown request shapes.
    Invalid,
    /// Authorization failure: mode not granted, user-group mismatch,
    /// expired or tampered ticket.
    AccessDenied,
    /// Unknown column, group, cell or id.
    NotFound,
    /// Duplicate creation, forbidden metadata update, double delete.
    Conflict,
    /// Database busy or downstream unavailable; retried once at the
    /// connection layer.
    Transient,
    /// Protocol-version mismatch or unsupported request type.
    Refused,
    /// Unrecoverable state (checksum migration failure, corruption); the
    /// server aborts.
    Fatal,
}

/// A portable error: kind plus human-readable context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct PepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> PepError {
        PepError {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::Invalid, message)
    }

    pub fn access_denied(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::AccessDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::Transient, message)
    }

    pub fn refused(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::Refused, message)
    }

    pub fn fatal(message: impl Into<String>) -> PepError {
        PepError::new(ErrorKind::Fatal, message)
    }
}

impl From<bincode::Error> for PepError {
    fn from(e: bincode::Error) -> Self {
        PepError::invalid(format!("serialization: {e}"))
    }
}

impl From<pep_curve::CurveError> for PepError {
    fn from(e: pep_curve::CurveError) -> Self {
        PepError::invalid(e.to_string())
    }
}

impl From<pep_crypto::PepCryptoError> for PepError {
    fn from(e: pep_crypto::PepCryptoError) -> Self {
        match e {
            pep_crypto::PepCryptoError::InvalidCiphertext => PepError::invalid(e.to_string()),
            pep_crypto::PepCryptoError::ProofRejected => PepError::access_denied(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_round_trip_through_serde() {
        let e = PepError::access_denied("mode write not granted");
        let bytes = bincode::serialize(&e).unwrap();
        let back: PepError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.kind, ErrorKind::AccessDenied);
    }
}
