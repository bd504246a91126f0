//! Operation contracts: commands, queries, flows.
//!
//! Commands build envelopes from typed params and nothing else; the
//! context deliberately has no database handle. Queries get the read-only
//! facade. Flows get an emitter that drives the pipeline to completion per
//! event and returns the derived id, plus the read-only facade for lookups
//! between emissions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use coterie_core::{EventId, RequestId};
use coterie_crypto::CryptoCtx;
use coterie_pipeline::Envelope;
use coterie_store::ReadOnlyDb;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("unknown operation: {0}")]
    Unknown(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A required row was missing from projected state.
    #[error("not found: {0}")]
    NotFound(String),

    /// The pipeline fatally dropped an envelope this operation emitted.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

/// The uniform response shape: `ids` maps each event type created exactly
/// once to its derived id; `data` is the operation's optional query block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OpResponse {
    pub ids: BTreeMap<String, EventId>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

/// What a command sees: time, correlation, crypto. No database.
#[derive(Debug, Clone)]
pub struct CommandCtx {
    pub request_id: RequestId,
    pub now_ms: i64,
    pub crypto: CryptoCtx,
}

pub trait CommandOp: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, params: JsonValue, ctx: &CommandCtx) -> Result<Vec<Envelope>, OpError>;
}

#[async_trait]
pub trait QueryOp: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, params: JsonValue, db: &ReadOnlyDb) -> Result<JsonValue, OpError>;
}

/// Handed to a flow; implemented by the runtime in `coterie-app`.
#[async_trait]
pub trait FlowEmitter: Send {
    /// Drive one envelope through the pipeline to quiescence and return the
    /// event id it was assigned. Errors surface the first fatal drop.
    async fn emit(&mut self, envelope: Envelope) -> Result<EventId, OpError>;

    fn request_id(&self) -> RequestId;

    fn now_ms(&self) -> i64;

    fn crypto(&self) -> &CryptoCtx;

    fn db(&self) -> &ReadOnlyDb;
}

#[async_trait]
pub trait FlowOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sequentially emit events; later steps may reference earlier ids
    /// directly. Returns the optional `data` block.
    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError>;
}

/// Result of one job invocation. On `ok = false` the runtime keeps the old
/// state and emits nothing; failure counters increment.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub ok: bool,
    pub state: JsonValue,
    pub envelopes: Vec<Envelope>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn ok(state: JsonValue, envelopes: Vec<Envelope>) -> Self {
        Self {
            ok: true,
            state,
            envelopes,
            error: None,
        }
    }

    pub fn failed(state: JsonValue, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            state,
            envelopes: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// A time-triggered function with persisted per-name state.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: JsonValue, db: &ReadOnlyDb, now_ms: i64) -> JobOutcome;
}

/// An event-triggered stateless function; envelopes it returns re-enter the
/// dispatcher.
#[async_trait]
pub trait Reflector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event types this reflector reacts to.
    fn event_types(&self) -> &'static [&'static str];

    async fn run(
        &self,
        envelope: &Envelope,
        db: &ReadOnlyDb,
        now_ms: i64,
    ) -> Result<Vec<Envelope>, OpError>;
}

/// One registered operation.
#[derive(Clone)]
pub enum Operation {
    Command(Arc<dyn CommandOp>),
    Query(Arc<dyn QueryOp>),
    Flow(Arc<dyn FlowOp>),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Command(op) => op.name(),
            Operation::Query(op) => op.name(),
            Operation::Flow(op) => op.name(),
        }
    }
}

/// Param helpers shared by the catalog.
pub(crate) fn require_str<'a>(params: &'a JsonValue, key: &str) -> Result<&'a str, OpError> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OpError::InvalidParams(format!("missing field: {key}")))
}

pub(crate) fn require_id(params: &JsonValue, key: &str) -> Result<EventId, OpError> {
    EventId::from_hex(require_str(params, key)?)
        .map_err(|e| OpError::InvalidParams(format!("{key}: {e}")))
}

pub(crate) fn require_u16(params: &JsonValue, key: &str) -> Result<u16, OpError> {
    params
        .get(key)
        .and_then(JsonValue::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| OpError::InvalidParams(format!("missing field: {key}")))
}
