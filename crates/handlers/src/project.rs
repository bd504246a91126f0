//! Projection: validated events → read-model deltas.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, ProjectorRegistry};
use coterie_store::applier;

use crate::store_err;

/// Routes validated, stored envelopes to their per-type projector and
/// applies the returned deltas inside this invocation's transaction, making
/// storage and projection atomic per envelope.
pub struct Project {
    projectors: Arc<ProjectorRegistry>,
}

impl Project {
    pub fn new(projectors: Arc<ProjectorRegistry>) -> Self {
        Self { projectors }
    }
}

#[async_trait]
impl Handler for Project {
    fn name(&self) -> &'static str {
        "project"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.validated && envelope.stored && envelope.keys_stored && !envelope.projected
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let deltas = self
            .projectors
            .project(&envelope)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        if !deltas.is_empty() {
            applier::apply(txn, &deltas).await.map_err(store_err)?;
        }

        debug!(
            event_id = ?envelope.event_id,
            event_type = envelope.kind(),
            deltas = deltas.len(),
            "event projected"
        );
        envelope.projected = true;
        Ok(vec![envelope])
    }
}
