//! Event-triggered reflectors.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use coterie_core::{DepKind, DepRef, EventId, RequestId};
use coterie_pipeline::Envelope;
use coterie_store::ReadOnlyDb;

use crate::events;
use crate::ops::{OpError, Reflector};

/// When a new peer appears on a network, re-offer the stored history so the
/// joiner converges. Each stored shareable event is re-emitted through the
/// outbound path; receivers that already hold an id dedup it at ingress, so
/// the fan-out is idempotent.
pub struct BackfillOnPeer;

/// Types worth re-sending. Local-only records and sealed key deliveries
/// stay home.
const SHAREABLE: &[&str] = &[
    events::GROUP,
    events::PEER,
    events::USER,
    events::CHANNEL,
    events::MESSAGE,
];

#[async_trait]
impl Reflector for BackfillOnPeer {
    fn name(&self) -> &'static str {
        "backfill_on_peer"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[events::PEER]
    }

    async fn run(
        &self,
        envelope: &Envelope,
        db: &ReadOnlyDb,
        _now_ms: i64,
    ) -> Result<Vec<Envelope>, OpError> {
        if envelope.self_created {
            return Ok(vec![]);
        }
        let Some(network_id) = envelope.network_id else {
            return Ok(vec![]);
        };

        let rows = db
            .query(
                r#"
                SELECT event_id, event_type, event_plaintext
                FROM events
                WHERE purged = 0 AND event_plaintext IS NOT NULL
                ORDER BY stored_at ASC, event_id ASC
                "#,
                &[],
            )
            .await
            .map_err(|e| OpError::Failed(e.to_string()))?;

        let network_hex = network_id.to_hex();
        let mut out = Vec::new();
        for row in rows {
            let event_type = row.get("event_type").and_then(JsonValue::as_str).unwrap_or("");
            if !SHAREABLE.contains(&event_type) {
                continue;
            }
            let Some(plaintext) = row
                .get("event_plaintext")
                .and_then(JsonValue::as_str)
                .and_then(|s| serde_json::from_str::<JsonValue>(s).ok())
            else {
                continue;
            };
            let scoped_to = plaintext
                .get("network_id")
                .or_else(|| plaintext.get("group_id"))
                .and_then(JsonValue::as_str);
            let on_network = scoped_to == Some(network_hex.as_str())
                || (event_type == events::GROUP
                    && row.get("event_id").and_then(JsonValue::as_str)
                        == Some(network_hex.as_str()));
            if !on_network {
                continue;
            }
            let Some(event_id) = row
                .get("event_id")
                .and_then(JsonValue::as_str)
                .and_then(|s| EventId::from_hex(s).ok())
            else {
                continue;
            };

            // A finished envelope pointed back at the outbound path; the
            // group dep gives the encrypt stage its key.
            let mut resend = Envelope {
                event_plaintext: Some(plaintext),
                event_type: Some(event_type.to_string()),
                event_id: Some(event_id),
                network_id: Some(network_id),
                self_created: true,
                sig_checked: true,
                validated: true,
                stored: true,
                keys_stored: true,
                projected: true,
                request_id: Some(RequestId::new()),
                ..Envelope::default()
            };
            if event_type != events::GROUP {
                resend
                    .deps
                    .push(DepRef::new(DepKind::Group, network_hex.clone()));
            }
            out.push(resend);
        }
        Ok(out)
    }
}

/// On every projected inbound message, emits a local-only `receipt` event
/// from each local member of the message's group (excluding the author).
pub struct MessageReceipt;

#[async_trait]
impl Reflector for MessageReceipt {
    fn name(&self) -> &'static str {
        "message_receipt"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[events::MESSAGE]
    }

    async fn run(
        &self,
        envelope: &Envelope,
        db: &ReadOnlyDb,
        now_ms: i64,
    ) -> Result<Vec<Envelope>, OpError> {
        if envelope.self_created {
            return Ok(vec![]);
        }
        let Some(message_id) = envelope.event_id else {
            return Ok(vec![]);
        };
        let Some(group_id) = envelope
            .event_plaintext
            .as_ref()
            .and_then(|p| p.get("group_id"))
            .and_then(JsonValue::as_str)
        else {
            return Ok(vec![]);
        };
        let author = envelope.peer_id.map(|p| p.to_hex()).unwrap_or_default();

        // Identity events are local-only, so joining through `identities`
        // selects exactly the peers this node operates.
        let rows = db
            .query(
                r#"
                SELECT p.peer_id, p.identity_id
                FROM peers p
                JOIN identities i ON i.identity_id = p.identity_id
                JOIN group_members gm ON gm.peer_id = p.peer_id
                WHERE gm.group_id = ?1 AND p.peer_id <> ?2
                ORDER BY p.peer_id ASC
                "#,
                &[json!(group_id), json!(author)],
            )
            .await
            .map_err(|e| OpError::Failed(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let peer_id = row
                .get("peer_id")
                .and_then(JsonValue::as_str)
                .and_then(|s| EventId::from_hex(s).ok());
            let identity_id = row
                .get("identity_id")
                .and_then(JsonValue::as_str)
                .and_then(|s| EventId::from_hex(s).ok());
            let (Some(peer_id), Some(identity_id)) = (peer_id, identity_id) else {
                continue;
            };

            let mut receipt = Envelope::self_created(
                events::RECEIPT,
                events::receipt(message_id, peer_id, now_ms),
                vec![
                    DepRef::new(DepKind::Identity, identity_id.to_hex()),
                    DepRef::new(DepKind::Message, message_id.to_hex()),
                ],
                RequestId::new(),
            );
            receipt.local_only = true;
            receipt.peer_id = Some(peer_id);
            receipt.network_id = envelope.network_id;
            out.push(receipt);
        }
        Ok(out)
    }
}
