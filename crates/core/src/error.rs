//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Domain-level error.
///
/// Deterministic failures only (parsing, malformed references, invariant
/// violations). Infrastructure concerns live in their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (wrong length, bad hex).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A dependency reference did not parse as `<kind>:<id>`.
    #[error("malformed dependency ref: {0}")]
    MalformedRef(String),

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn malformed_ref(msg: impl Into<String>) -> Self {
        Self::MalformedRef(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
