//! Ingress: raw datagram → transit-layer envelope.

use async_trait::async_trait;
use tracing::debug;

use coterie_core::{DepKind, DepRef};
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError};

use crate::wire;

/// Parses the outer datagram layout and declares the transit-key dependency.
/// Pure: address bookkeeping happens downstream once attribution is known.
pub struct Receive;

#[async_trait]
impl Handler for Receive {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.raw_data.is_some() && envelope.transit_ciphertext.is_none()
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let raw = envelope
            .raw_data
            .take()
            .ok_or_else(|| HandlerError::Malformed("receive: raw_data vanished".into()))?;

        let (transit_key_id, transit_ciphertext) = match wire::split_datagram(&raw) {
            Ok(parts) => parts,
            Err(e) => {
                debug!(origin = ?envelope.origin_ip, error = %e, "unparseable datagram dropped");
                return Ok(vec![]);
            }
        };

        envelope.transit_key_id = Some(transit_key_id);
        envelope.transit_ciphertext = Some(transit_ciphertext);
        envelope.add_dep(DepRef::new(DepKind::TransitKey, transit_key_id.to_hex()));

        Ok(vec![envelope])
    }
}
