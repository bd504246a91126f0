//! Store error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(String),

    /// A persisted row failed to decode back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The read-only facade refused a mutating statement.
    #[error("rejected statement: {0}")]
    Rejected(String),

    /// A projection delta referenced an invalid table/column identifier or
    /// an empty mutation.
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serde(value.to_string())
    }
}
