//! Validation and storage.
//!
//! Runs the per-type validator, deduplicates against the event store, and
//! writes the canonical event. Rejected events leave a purged tombstone so
//! re-delivery of the same id is silently dropped instead of re-processed.
//! A second arm services tombstone-GC control envelopes emitted by the
//! housekeeping job, since this handler owns the events table.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, KeyRef, ValidatorRegistry};
use coterie_store::{addresses, event_store};

use crate::{now_ms, store_err};

pub struct Validate {
    validators: Arc<ValidatorRegistry>,
    tombstone_ttl_ms: i64,
}

impl Validate {
    pub fn new(validators: Arc<ValidatorRegistry>, tombstone_ttl_ms: i64) -> Self {
        Self {
            validators,
            tombstone_ttl_ms,
        }
    }

    fn wants_store(envelope: &Envelope) -> bool {
        envelope.sig_checked
            && !envelope.stored
            && envelope.deps_included_and_valid
            && envelope.event_plaintext.is_some()
            && envelope.event_id.is_some()
            && group_gate(envelope)
    }

    fn wants_gc(envelope: &Envelope) -> bool {
        envelope.gc_tombstones_before.is_some()
    }
}

/// A group-scoped claim must have passed the membership check first.
fn group_gate(envelope: &Envelope) -> bool {
    let claimed = envelope
        .event_plaintext
        .as_ref()
        .map(|p| p.get("group_id").is_some() && p.get("group_member_id").is_some())
        .unwrap_or(false);
    !claimed || envelope.is_group_member
}

#[async_trait]
impl Handler for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        Self::wants_store(envelope) || Self::wants_gc(envelope)
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        if Self::wants_gc(&envelope) {
            let before = envelope
                .gc_tombstones_before
                .ok_or_else(|| HandlerError::Malformed("gc envelope without timestamp".into()))?;
            let removed = event_store::delete_expired_tombstones(txn, before)
                .await
                .map_err(store_err)?;
            if removed > 0 {
                info!(removed, "expired tombstones deleted");
            }
            return Ok(vec![]);
        }

        let event_id = envelope
            .event_id
            .ok_or_else(|| HandlerError::Malformed("store without event_id".into()))?;
        let event_type = envelope
            .kind()
            .map(str::to_string)
            .ok_or_else(|| HandlerError::Malformed("store without event type".into()))?;

        // Duplicate ids (including purged tombstones) are silently deduped.
        if event_store::exists(txn, event_id).await.map_err(store_err)? {
            debug!(%event_id, "duplicate event id, envelope dropped");
            return Ok(vec![]);
        }

        // Sealed key events arrive pre-validated by unwrap; everything else
        // faces its per-type validator.
        if !envelope.validated && !self.validators.validate(&envelope) {
            warn!(%event_id, event_type, "validator rejected event, purging");
            event_store::put_tombstone(
                txn,
                event_id,
                &event_type,
                "validator rejection",
                now_ms(),
                self.tombstone_ttl_ms,
            )
            .await
            .map_err(store_err)?;
            return Ok(vec![]);
        }

        let now = now_ms();
        let plaintext = envelope.event_plaintext.clone();
        let key_id = match envelope.key_ref {
            Some(KeyRef::Key { key_id }) => Some(key_id),
            _ => None,
        };
        event_store::put(
            txn,
            &event_store::NewEvent {
                event_id,
                event_type: &event_type,
                plaintext: plaintext.as_ref(),
                ciphertext: envelope.event_ciphertext.as_deref(),
                key_id,
                received_at: envelope.received_at,
                origin_ip: envelope.origin_ip.as_deref(),
                origin_port: envelope.origin_port,
                stored_at: now,
            },
        )
        .await
        .map_err(store_err)?;

        // Remember where this peer talks from.
        if let (Some(peer_id), Some(ip), Some(port)) =
            (envelope.peer_id, envelope.origin_ip.clone(), envelope.origin_port)
        {
            addresses::upsert(txn, &peer_id.to_hex(), envelope.network_id, &ip, port, now)
                .await
                .map_err(store_err)?;
        }

        envelope.validated = true;
        envelope.stored = true;
        Ok(vec![envelope])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::EventId;
    use coterie_pipeline::Validator;
    use serde_json::json;

    struct ContentRequired;

    impl Validator for ContentRequired {
        fn event_type(&self) -> &'static str {
            "message"
        }

        fn validate(&self, envelope: &Envelope) -> bool {
            envelope
                .plaintext_str("content")
                .is_some_and(|c| !c.is_empty())
        }
    }

    fn validators() -> Arc<ValidatorRegistry> {
        let mut reg = ValidatorRegistry::new();
        reg.register(Arc::new(ContentRequired));
        Arc::new(reg)
    }

    async fn setup() -> sqlx::SqlitePool {
        let pool = coterie_store::open_in_memory().await.unwrap();
        coterie_store::run_migrations(&pool, []).await.unwrap();
        pool
    }

    fn ready(plaintext: serde_json::Value, id: u8) -> Envelope {
        Envelope {
            sig_checked: true,
            deps_included_and_valid: true,
            event_plaintext: Some(plaintext),
            event_id: Some(EventId::from_bytes([id; 16])),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn valid_event_is_stored() {
        let pool = setup().await;
        let handler = Validate::new(validators(), 1_000);
        let mut txn = pool.begin().await.unwrap();

        let envelope = ready(json!({"type": "message", "content": "hi"}), 1);
        assert!(handler.filter(&envelope));

        let out = handler.process(envelope, &mut txn).await.unwrap();
        assert!(out[0].validated && out[0].stored);
        assert!(event_store::exists(&mut txn, EventId::from_bytes([1; 16]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejected_event_is_purged_and_future_ingress_deduped() {
        let pool = setup().await;
        let handler = Validate::new(validators(), 1_000);
        let mut txn = pool.begin().await.unwrap();
        let id = EventId::from_bytes([2; 16]);

        let bad = ready(json!({"type": "message", "content": ""}), 2);
        let out = handler.process(bad.clone(), &mut txn).await.unwrap();
        assert!(out.is_empty());

        let stored = event_store::get(&mut txn, id).await.unwrap().unwrap();
        assert!(stored.purged);

        // Re-delivery of the same id is silently dropped, not re-validated.
        let out = handler.process(bad, &mut txn).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn duplicate_store_is_a_silent_drop() {
        let pool = setup().await;
        let handler = Validate::new(validators(), 1_000);
        let mut txn = pool.begin().await.unwrap();

        let envelope = ready(json!({"type": "message", "content": "hi"}), 3);
        let first = handler.process(envelope.clone(), &mut txn).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = handler.process(envelope, &mut txn).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn group_scoped_claims_require_the_membership_flag() {
        let handler = Validate::new(validators(), 1_000);
        let claimed = ready(
            json!({"type": "message", "content": "x", "group_id": "g", "group_member_id": "m"}),
            4,
        );
        assert!(!handler.filter(&claimed));

        let mut passed = claimed.clone();
        passed.is_group_member = true;
        assert!(handler.filter(&passed));
    }

    #[tokio::test]
    async fn pre_validated_key_events_skip_the_validator() {
        let pool = setup().await;
        let handler = Validate::new(validators(), 1_000);
        let mut txn = pool.begin().await.unwrap();

        let mut envelope = ready(json!({"type": "key", "secret": "aa"}), 5);
        envelope.validated = true;

        let out = handler.process(envelope, &mut txn).await.unwrap();
        assert!(out[0].stored);
    }

    #[tokio::test]
    async fn gc_arm_deletes_expired_tombstones() {
        let pool = setup().await;
        let handler = Validate::new(validators(), 10);
        let mut txn = pool.begin().await.unwrap();
        let id = EventId::from_bytes([6; 16]);

        event_store::put_tombstone(&mut txn, id, "message", "test", 100, 10)
            .await
            .unwrap();

        let gc = Envelope {
            gc_tombstones_before: Some(1_000),
            ..Envelope::default()
        };
        assert!(handler.filter(&gc));
        let out = handler.process(gc, &mut txn).await.unwrap();
        assert!(out.is_empty());
        assert!(!event_store::exists(&mut txn, id).await.unwrap());
    }
}
