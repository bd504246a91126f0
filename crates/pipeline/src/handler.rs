//! Handler contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Envelope;

/// The transaction handed to a handler invocation. One transaction per
/// envelope-handler pair; committed by the dispatcher on success, rolled
/// back (and the envelope dropped) on error.
pub type DbTxn<'c> = sqlx::Transaction<'c, sqlx::Sqlite>;

/// Errors local to one envelope. None of these abort the dispatch loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Schema violation on the envelope itself; fatal drop.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Unrecoverable processing failure; fatal drop.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Transient I/O failure; transaction rolls back, caller may retry.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A pure filter + transform over envelopes.
///
/// `filter` must be cheap and side-effect free. `process` consumes the
/// envelope and returns its replacements; returning an empty vector ends the
/// envelope (terminal state or silent drop). Handlers must not block on I/O
/// beyond the provided transaction.
///
/// Filters of registered handlers are designed to be pairwise disjoint over
/// the envelope stage flags, so registry order is not observable in outputs.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable name; the registry orders handlers by it.
    fn name(&self) -> &'static str;

    fn filter(&self, envelope: &Envelope) -> bool;

    async fn process(
        &self,
        envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError>;
}
