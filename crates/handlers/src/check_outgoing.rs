//! Outbound fan-out.
//!
//! Projected self-created events (unless local-only) are copied once per
//! destination: sealed `key` events go only to their recipient, everything
//! else goes to every known address on the network. Each copy picks up the
//! network's transit key as a dependency, which routes it back through the
//! resolver before encryption.

use async_trait::async_trait;
use tracing::{debug, warn};

use coterie_core::{DepKind, DepRef, EventId};
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError};
use coterie_store::{addresses, secrets};

use crate::store_err;

pub struct CheckOutgoing;

#[async_trait]
impl Handler for CheckOutgoing {
    fn name(&self) -> &'static str {
        "check_outgoing"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.projected
            && envelope.self_created
            && !envelope.local_only
            && !envelope.outgoing
            && !envelope.outgoing_checked
    }

    async fn process(
        &self,
        envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let network = envelope.network_id.or_else(|| {
            (envelope.kind() == Some("group")).then_some(envelope.event_id).flatten()
        });
        let Some(network) = network else {
            debug!(event_id = ?envelope.event_id, "no network attribution, nothing to send");
            return Ok(vec![]);
        };

        let Some(transit) = secrets::transit_key_for_network(txn, network)
            .await
            .map_err(store_err)?
        else {
            warn!(%network, "no transit key for network, outbound suppressed");
            return Ok(vec![]);
        };

        let destinations = if envelope.kind() == Some("key") {
            recipient_address(&envelope, txn).await?
        } else {
            addresses::list_for_network(txn, network)
                .await
                .map_err(store_err)?
                .into_iter()
                .map(|row| (row.ip, row.port))
                .collect()
        };

        if destinations.is_empty() {
            debug!(%network, event_id = ?envelope.event_id, "no known addresses, nothing to send");
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(destinations.len());
        for (ip, port) in destinations {
            let mut copy = envelope.clone();
            copy.outgoing = true;
            copy.outgoing_checked = true;
            copy.dest_ip = Some(ip);
            copy.dest_port = Some(port);
            copy.transit_key_id = Some(transit.key_id);
            copy.add_dep(DepRef::new(DepKind::TransitKey, transit.key_id.to_hex()));
            out.push(copy);
        }
        Ok(out)
    }
}

/// The single destination of a sealed key event: its recipient peer.
async fn recipient_address(
    envelope: &Envelope,
    txn: &mut DbTxn<'_>,
) -> Result<Vec<(String, u16)>, HandlerError> {
    let Some((dep, _)) = envelope.dep_of_kind(DepKind::Peer) else {
        return Ok(vec![]);
    };
    let peer_id = EventId::from_hex(&dep.id)
        .map_err(|e| HandlerError::Malformed(format!("recipient id: {e}")))?;

    Ok(addresses::get(txn, &peer_id.to_hex())
        .await
        .map_err(store_err)?
        .map(|row| vec![(row.ip, row.port)])
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::Secret;
    use serde_json::json;

    async fn setup() -> sqlx::SqlitePool {
        let pool = coterie_store::open_in_memory().await.unwrap();
        coterie_store::run_migrations(&pool, []).await.unwrap();
        pool
    }

    fn ready(network: EventId) -> Envelope {
        Envelope {
            projected: true,
            validated: true,
            stored: true,
            keys_stored: true,
            self_created: true,
            deps_included_and_valid: true,
            network_id: Some(network),
            event_id: Some(EventId::from_bytes([1; 16])),
            event_plaintext: Some(json!({"type": "message", "content": "hi"})),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_known_address() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let network = EventId::from_bytes([9; 16]);
        let secret = Secret::from_bytes([2; 32]);
        let key_id = coterie_crypto::hashing::key_id(&secret);

        secrets::insert_transit_key(&mut txn, key_id, Some(network), &secret, 1, None)
            .await
            .unwrap();
        addresses::upsert(&mut txn, "aa", Some(network), "10.0.0.1", 7001, 1).await.unwrap();
        addresses::upsert(&mut txn, "bb", Some(network), "10.0.0.2", 7002, 2).await.unwrap();

        let envelope = ready(network);
        assert!(CheckOutgoing.filter(&envelope));
        let out = CheckOutgoing.process(envelope, &mut txn).await.unwrap();

        assert_eq!(out.len(), 2);
        for copy in &out {
            assert!(copy.outgoing && copy.outgoing_checked);
            assert_eq!(copy.transit_key_id, Some(key_id));
            // The transit dep was added, so the resolver runs again.
            assert!(!copy.deps_included_and_valid);
        }
        let ips: Vec<_> = out.iter().map(|c| c.dest_ip.clone().unwrap()).collect();
        assert!(ips.contains(&"10.0.0.1".to_string()));
        assert!(ips.contains(&"10.0.0.2".to_string()));
    }

    #[tokio::test]
    async fn local_only_envelopes_never_match() {
        let mut envelope = ready(EventId::from_bytes([9; 16]));
        envelope.local_only = true;
        assert!(!CheckOutgoing.filter(&envelope));
    }

    #[tokio::test]
    async fn no_transit_key_suppresses_outbound() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let network = EventId::from_bytes([9; 16]);
        addresses::upsert(&mut txn, "aa", Some(network), "10.0.0.1", 7001, 1).await.unwrap();

        let out = CheckOutgoing.process(ready(network), &mut txn).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn key_events_target_only_their_recipient() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let network = EventId::from_bytes([9; 16]);
        let recipient = EventId::from_bytes([5; 16]);
        let secret = Secret::from_bytes([2; 32]);

        secrets::insert_transit_key(
            &mut txn,
            coterie_crypto::hashing::key_id(&secret),
            Some(network),
            &secret,
            1,
            None,
        )
        .await
        .unwrap();
        addresses::upsert(&mut txn, &recipient.to_hex(), Some(network), "10.0.0.5", 7005, 1)
            .await
            .unwrap();
        addresses::upsert(&mut txn, "other", Some(network), "10.0.0.6", 7006, 1)
            .await
            .unwrap();

        let mut envelope = ready(network);
        envelope.event_plaintext = Some(json!({"type": "key", "secret": "aa"}));
        envelope.deps.push(DepRef::new(DepKind::Peer, recipient.to_hex()));

        let out = CheckOutgoing.process(envelope, &mut txn).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest_ip.as_deref(), Some("10.0.0.5"));
    }
}
