//! Per-type projectors: validated envelope → declarative deltas.
//!
//! Projectors are pure like validators; DB writes happen in the delta
//! applier, never here. Each projector also declares the schema of the
//! tables it projects into, which the store runs at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::delta::Delta;
use crate::envelope::Envelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// The validated plaintext was missing a field the projector needs.
    /// Should not happen for events the matching validator accepted.
    #[error("projection failed: {0}")]
    Failed(String),
}

pub trait Projector: Send + Sync {
    /// The event type this projector owns.
    fn event_type(&self) -> &'static str;

    /// DDL for the projected tables (idempotent `CREATE TABLE IF NOT EXISTS`).
    fn schema(&self) -> &'static str;

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError>;
}

/// Projectors by event type. Types without a projector yield no deltas.
#[derive(Default, Clone)]
pub struct ProjectorRegistry {
    projectors: BTreeMap<&'static str, Arc<dyn Projector>>,
}

impl ProjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, projector: Arc<dyn Projector>) {
        self.projectors.insert(projector.event_type(), projector);
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn Projector>> {
        self.projectors.get(event_type)
    }

    /// Project an envelope; types with no registered projector are no-ops.
    pub fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        match envelope.kind().and_then(|t| self.projectors.get(t)) {
            Some(p) => p.project(envelope),
            None => Ok(vec![]),
        }
    }

    /// All declared schemas, in stable type order.
    pub fn schemas(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.projectors.values().map(|p| p.schema())
    }
}

impl std::fmt::Debug for ProjectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectorRegistry")
            .field("types", &self.projectors.keys().collect::<Vec<_>>())
            .finish()
    }
}
