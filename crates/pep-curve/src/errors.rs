//! # Curve Error Types

use thiserror::Error;

/// Errors from point and scalar parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CurveError {
    /// The encoding is not a point on the curve in the prime-order subgroup.
    #[error("invalid curve point encoding")]
    InvalidPoint,

    /// The encoding is not a canonical scalar.
    #[error("invalid scalar encoding")]
    InvalidScalar,
}
