//! Local secret persistence.
//!
//! Owns `signing_keys`, `transit_keys`, and `event_keys`. Stored envelopes
//! pass through here exactly once: any secret material they carry (a
//! bootstrap identity seed, freshly minted group keys, invite-delivered
//! secrets, or the payload of a sealed `key` event) is persisted before
//! projection, so later pipeline stages and the resolver can rely on it.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use coterie_core::{EventId, KeyId, Secret};
use coterie_crypto::hashing;
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError};
use coterie_store::{addresses, secrets};

use crate::{now_ms, store_err};

pub struct Keys;

impl Keys {
    fn network_of(envelope: &Envelope) -> Option<EventId> {
        envelope.network_id.or_else(|| {
            // A group event bootstraps its own network.
            (envelope.kind() == Some("group")).then_some(envelope.event_id?)
        })
    }
}

#[async_trait]
impl Handler for Keys {
    fn name(&self) -> &'static str {
        "keys"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.stored && !envelope.keys_stored
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let now = now_ms();
        let network = Self::network_of(&envelope);
        let group = group_of(&envelope);

        if let Some(lm) = envelope.local_metadata.clone() {
            if let (Some(seed), Some(event_id)) = (&lm.private_key, envelope.event_id) {
                secrets::insert_signing_key(txn, &event_id.to_hex(), network, seed, now)
                    .await
                    .map_err(store_err)?;
                debug!(id = %event_id, "signing key stored");
            }

            if let Some(secret) = &lm.event_key_secret {
                let key_id = hashing::key_id(secret);
                secrets::insert_event_key(txn, key_id, network, group, secret, now, None)
                    .await
                    .map_err(store_err)?;
                debug!(%key_id, "event key stored");
            }

            if let Some(secret) = &lm.transit_secret {
                let key_id = hashing::key_id(secret);
                secrets::insert_transit_key(txn, key_id, network, secret, now, None)
                    .await
                    .map_err(store_err)?;
                debug!(%key_id, "transit key stored");
            }

            if let Some((ip, port)) = &lm.bootstrap_addr {
                let hint = format!("{ip}:{port}");
                addresses::upsert(txn, &hint, network, ip, *port, now)
                    .await
                    .map_err(store_err)?;
            }
        }

        // A self-created peer record re-keys its identity seed under the
        // peer id, so deps naming either id resolve to the same material.
        if envelope.self_created && envelope.kind() == Some("peer") {
            if let (Some(seed), Some(peer_id)) = (identity_seed(&envelope), envelope.event_id) {
                secrets::insert_signing_key(txn, &peer_id.to_hex(), network, &seed, now)
                    .await
                    .map_err(store_err)?;
                debug!(id = %peer_id, "signing key stored under peer id");
            }
        }

        // Sealed key events deliver a group key in their plaintext.
        if envelope.kind() == Some("key") {
            self.store_delivered_key(&envelope, txn).await?;
        }

        envelope.keys_stored = true;
        Ok(vec![envelope])
    }
}

impl Keys {
    async fn store_delivered_key(
        &self,
        envelope: &Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<(), HandlerError> {
        let Some(plaintext) = envelope.event_plaintext.as_ref() else {
            return Ok(());
        };
        let declared = plaintext
            .get("key_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| KeyId::from_hex(s).ok());
        let secret = plaintext
            .get("secret")
            .and_then(JsonValue::as_str)
            .and_then(|s| Secret::from_hex(s).ok());

        let (Some(declared), Some(secret)) = (declared, secret) else {
            warn!(event_id = ?envelope.event_id, "key event without usable material");
            return Ok(());
        };

        if hashing::key_id(&secret) != declared {
            warn!(event_id = ?envelope.event_id, "key event id does not match its secret, ignored");
            return Ok(());
        }

        secrets::insert_event_key(
            txn,
            declared,
            Self::network_of(envelope),
            group_of(envelope),
            &secret,
            now_ms(),
            None,
        )
        .await
        .map_err(store_err)?;
        debug!(key_id = %declared, "delivered event key stored");
        Ok(())
    }
}

/// The signing seed behind a self-created envelope: carried directly or on
/// the resolved identity dep.
fn identity_seed(envelope: &Envelope) -> Option<Secret> {
    if let Some(seed) = envelope
        .local_metadata
        .as_ref()
        .and_then(|lm| lm.private_key.clone())
    {
        return Some(seed);
    }
    match envelope.resolved_of_kind(coterie_core::DepKind::Identity)? {
        coterie_pipeline::ResolvedDep::Identity {
            local_metadata: Some(lm),
            ..
        } => lm.private_key.clone(),
        _ => None,
    }
}

fn group_of(envelope: &Envelope) -> Option<EventId> {
    if envelope.kind() == Some("group") {
        return envelope.event_id;
    }
    envelope
        .event_plaintext
        .as_ref()?
        .get("group_id")?
        .as_str()
        .and_then(|s| EventId::from_hex(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_pipeline::LocalMetadata;
    use serde_json::json;

    async fn setup() -> sqlx::SqlitePool {
        let pool = coterie_store::open_in_memory().await.unwrap();
        coterie_store::run_migrations(&pool, []).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn identity_seed_is_persisted_under_the_event_id() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let seed = Secret::from_bytes([1; 32]);
        let id = EventId::from_bytes([2; 16]);

        let envelope = Envelope {
            stored: true,
            event_id: Some(id),
            event_plaintext: Some(json!({"type": "identity"})),
            local_metadata: Some(LocalMetadata {
                private_key: Some(seed.clone()),
                ..Default::default()
            }),
            ..Envelope::default()
        };
        assert!(Keys.filter(&envelope));

        let out = Keys.process(envelope, &mut txn).await.unwrap();
        assert!(out[0].keys_stored);

        let row = secrets::get_signing_key(&mut txn, &id.to_hex())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.private_key, seed);
    }

    #[tokio::test]
    async fn group_bootstrap_mints_both_key_tables() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let event_key = Secret::from_bytes([3; 32]);
        let transit = Secret::from_bytes([4; 32]);
        let group_id = EventId::from_bytes([5; 16]);

        let envelope = Envelope {
            stored: true,
            event_id: Some(group_id),
            event_plaintext: Some(json!({"type": "group", "name": "ops"})),
            local_metadata: Some(LocalMetadata {
                event_key_secret: Some(event_key.clone()),
                transit_secret: Some(transit.clone()),
                ..Default::default()
            }),
            ..Envelope::default()
        };
        Keys.process(envelope, &mut txn).await.unwrap();

        let ek = secrets::get_event_key(&mut txn, hashing::key_id(&event_key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ek.network_id, Some(group_id));
        assert_eq!(ek.group_id, Some(group_id));

        let tk = secrets::transit_key_for_network(&mut txn, group_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tk.secret, transit);
    }

    #[tokio::test]
    async fn delivered_key_events_land_in_event_keys() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let secret = Secret::from_bytes([6; 32]);
        let key_id = hashing::key_id(&secret);

        let envelope = Envelope {
            stored: true,
            validated: true,
            event_id: Some(EventId::from_bytes([7; 16])),
            event_plaintext: Some(json!({
                "type": "key",
                "key_id": key_id.to_hex(),
                "secret": secret.to_hex(),
            })),
            ..Envelope::default()
        };
        Keys.process(envelope, &mut txn).await.unwrap();

        let row = secrets::get_event_key(&mut txn, key_id).await.unwrap().unwrap();
        assert_eq!(row.secret, secret);
    }

    #[tokio::test]
    async fn key_event_with_wrong_id_is_ignored() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let secret = Secret::from_bytes([6; 32]);
        let wrong = KeyId::from_bytes([9; 32]);

        let envelope = Envelope {
            stored: true,
            event_id: Some(EventId::from_bytes([7; 16])),
            event_plaintext: Some(json!({
                "type": "key",
                "key_id": wrong.to_hex(),
                "secret": secret.to_hex(),
            })),
            ..Envelope::default()
        };
        Keys.process(envelope, &mut txn).await.unwrap();

        assert!(secrets::get_event_key(&mut txn, wrong).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plain_envelopes_just_advance_the_flag() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();

        let envelope = Envelope {
            stored: true,
            event_id: Some(EventId::from_bytes([8; 16])),
            event_plaintext: Some(json!({"type": "message", "content": "hi"})),
            ..Envelope::default()
        };
        let out = Keys.process(envelope, &mut txn).await.unwrap();
        assert!(out[0].keys_stored);
    }
}
