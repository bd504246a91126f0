//! The send boundary.
//!
//! Converts a wire-ready envelope into an [`OutgoingTransitEnvelope`] and
//! persists it in the outbox for the network layer to drain. The conversion
//! is the leakage barrier: the outbound type has no fields for plaintext,
//! resolved deps, or local metadata, so nothing else can cross.

use async_trait::async_trait;
use tracing::debug;

use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, OutgoingTransitEnvelope};
use coterie_store::outbox;

use crate::{now_ms, store_err};

pub struct Send;

#[async_trait]
impl Handler for Send {
    fn name(&self) -> &'static str {
        "send"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.outgoing && envelope.transit_ciphertext.is_some()
    }

    async fn process(
        &self,
        envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let wire = OutgoingTransitEnvelope::try_from(&envelope)
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;

        let outbox_id = outbox::push(txn, &wire, now_ms()).await.map_err(store_err)?;
        debug!(
            outbox_id,
            dest = format!("{}:{}", wire.dest_ip, wire.dest_port),
            "datagram queued"
        );

        Ok(vec![])
    }
}
