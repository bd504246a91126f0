//! The envelope pipeline engine.
//!
//! A filter-dispatched transformation fabric: small handlers subscribe to
//! envelopes by predicate, transform them inside a per-invocation SQLite
//! transaction, and re-emit them onto a FIFO queue. The dispatcher drives the
//! queue to quiescence with bounded retries.
//!
//! This crate is mechanics only: the envelope value type, the handler
//! contract and registry, the dispatcher, the declarative projection delta
//! model, and the validator/projector contracts. Concrete handlers live in
//! `coterie-handlers`; the event catalog lives in `coterie-protocol`.

pub mod delta;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod projector;
pub mod registry;
pub mod validator;

pub use delta::{Delta, MemoryApplier, MemoryApplyError, OnConflict};
pub use dispatcher::{DispatchReport, Dispatcher, Outcome};
pub use envelope::{Envelope, KeyRef, LocalMetadata, OutgoingTransitEnvelope, ResolvedDep};
pub use handler::{DbTxn, Handler, HandlerError};
pub use projector::{ProjectionError, Projector, ProjectorRegistry};
pub use registry::HandlerRegistry;
pub use validator::{Validator, ValidatorRegistry};

/// Default bound on re-emissions of one envelope before it is fatally
/// dropped; guards against cyclic dependency graphs.
pub const DEFAULT_RETRY_CAP: u32 = 100;
