//! Dependency resolver: the blocker/unblocker.
//!
//! Resolve arm: fulfils the contract that a downstream handler observing
//! `deps_included_and_valid = true` may rely on `resolved_deps` containing
//! every entry in `deps`. Unresolved envelopes are parked in the blocked
//! table and replaced by a terminal `missing_deps` companion.
//!
//! Unblock arm: when an event reaches `validated ∧ stored`, every envelope
//! parked on its id is rewoken in insertion order with its retry counter
//! bumped; the dispatcher enforces the cap.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use coterie_core::{DepKind, DepRef, EventId};
use coterie_crypto::hashing;
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, LocalMetadata, ResolvedDep};
use coterie_store::{addresses, blocked, event_store, secrets};

use crate::{now_ms, store_err};

pub struct ResolveDeps;

impl ResolveDeps {
    fn wants_resolve(envelope: &Envelope) -> bool {
        envelope.raw_data.is_none()
            && !envelope.deps_included_and_valid
            && !envelope.missing_deps
    }

    fn wants_unblock(envelope: &Envelope) -> bool {
        envelope.validated
            && envelope.stored
            && !envelope.keys_stored
            && envelope.event_id.is_some()
    }
}

#[async_trait]
impl Handler for ResolveDeps {
    fn name(&self) -> &'static str {
        "resolve_deps"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        Self::wants_resolve(envelope) || Self::wants_unblock(envelope)
    }

    async fn process(
        &self,
        envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        if Self::wants_resolve(&envelope) {
            resolve(envelope, txn).await
        } else {
            unblock(envelope, txn).await
        }
    }
}

async fn resolve(
    mut envelope: Envelope,
    txn: &mut DbTxn<'_>,
) -> Result<Vec<Envelope>, HandlerError> {
    let mut missing: Vec<DepRef> = Vec::new();

    for dep in envelope.deps.clone() {
        let key = dep.to_string();
        if envelope.resolved_deps.contains_key(&key) {
            continue;
        }
        match resolve_one(txn, &dep).await? {
            Some(payload) => {
                envelope.resolved_deps.insert(key, payload);
            }
            None => missing.push(dep),
        }
    }

    if missing.is_empty() {
        envelope.deps_included_and_valid = true;
        envelope.unblocked = false;
        return Ok(vec![envelope]);
    }

    let blocked_id = envelope
        .event_id
        .map(|id| id.to_hex())
        .unwrap_or_else(|| synthetic_id(&envelope));

    // The parked copy goes in clean so a rewake re-enters the resolve arm.
    let mut parked = envelope.clone();
    parked.missing_deps = false;
    parked.missing_dep_list.clear();
    parked.unblocked = false;

    blocked::park(txn, &blocked_id, &parked, &missing, now_ms())
        .await
        .map_err(store_err)?;

    debug!(
        blocked_id,
        missing = ?missing.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "envelope parked on missing dependencies"
    );

    // The main envelope is replaced by a terminal companion that records the
    // park for observers.
    envelope.missing_deps = true;
    envelope.missing_dep_list = missing;
    Ok(vec![envelope])
}

async fn unblock(envelope: Envelope, txn: &mut DbTxn<'_>) -> Result<Vec<Envelope>, HandlerError> {
    let arrived = envelope
        .event_id
        .ok_or_else(|| HandlerError::Malformed("unblock without event_id".into()))?;

    let woken = blocked::take_for_dep(txn, &arrived.to_hex())
        .await
        .map_err(store_err)?;

    let mut out = Vec::with_capacity(woken.len());
    for row in woken {
        let mut rewoken = row.envelope;
        rewoken.deps_included_and_valid = false;
        rewoken.unblocked = true;
        rewoken.missing_deps = false;
        rewoken.missing_dep_list.clear();
        rewoken.retry_count = row.retry_count + 1;

        info!(
            blocked_id = row.blocked_id,
            arrived = %arrived,
            retry_count = rewoken.retry_count,
            "parked envelope rewoken"
        );
        out.push(rewoken);
    }
    Ok(out)
}

async fn resolve_one(
    conn: &mut SqliteConnection,
    dep: &DepRef,
) -> Result<Option<ResolvedDep>, HandlerError> {
    match dep.kind {
        kind if kind.is_event_backed() => {
            let Some(event) = event_store::get_validated(conn, &dep.id)
                .await
                .map_err(store_err)?
            else {
                return Ok(None);
            };

            if !kind_accepts(kind, &event.event_type) {
                return Err(HandlerError::Malformed(format!(
                    "dep {dep} resolved to event of type {}",
                    event.event_type
                )));
            }

            let plaintext = match event.plaintext {
                Some(p) => p,
                // Stored without a body (should not happen for non-purged
                // rows); treat as unresolved rather than hand out garbage.
                None => return Ok(None),
            };

            if matches!(kind, DepKind::Identity | DepKind::Peer) {
                let local_metadata = secrets::get_signing_key(conn, &dep.id)
                    .await
                    .map_err(store_err)?
                    .map(|row| LocalMetadata {
                        private_key: Some(row.private_key),
                        ..LocalMetadata::default()
                    });
                Ok(Some(ResolvedDep::Identity {
                    event_id: event.event_id,
                    plaintext,
                    local_metadata,
                }))
            } else {
                Ok(Some(ResolvedDep::ValidatedEvent {
                    event_type: event.event_type,
                    event_id: event.event_id,
                    plaintext,
                }))
            }
        }

        DepKind::Key => {
            let key_id = parse_key_id(dep)?;
            Ok(secrets::get_event_key(conn, key_id)
                .await
                .map_err(store_err)?
                .map(|row| ResolvedDep::TransitKey {
                    key_id: row.key_id,
                    secret: row.secret,
                    network_id: row.network_id,
                }))
        }

        DepKind::TransitKey => {
            let key_id = parse_key_id(dep)?;
            Ok(secrets::get_transit_key(conn, key_id)
                .await
                .map_err(store_err)?
                .map(|row| ResolvedDep::TransitKey {
                    key_id: row.key_id,
                    secret: row.secret,
                    network_id: row.network_id,
                }))
        }

        DepKind::Address => {
            let peer_id = EventId::from_hex(&dep.id)
                .map_err(|e| HandlerError::Malformed(format!("dep {dep}: {e}")))?;
            Ok(addresses::get(conn, &dep.id)
                .await
                .map_err(store_err)?
                .map(|row| ResolvedDep::Address {
                    peer_id,
                    ip: row.ip,
                    port: row.port,
                }))
        }

        // Unreachable: every variant is either event-backed (handled by the
        // guard above) or one of the three explicit non-event-backed kinds.
        _ => unreachable!("DepKind variant without a resolver case"),
    }
}

fn kind_accepts(kind: DepKind, event_type: &str) -> bool {
    match kind {
        // An identity dep accepts the peer record holding the same key
        // material; the unseal path names recipients by peer id.
        DepKind::Identity => matches!(event_type, "identity" | "peer"),
        other => other.as_str() == event_type,
    }
}

fn parse_key_id(dep: &DepRef) -> Result<coterie_core::KeyId, HandlerError> {
    coterie_core::KeyId::from_hex(&dep.id)
        .map_err(|e| HandlerError::Malformed(format!("dep {dep}: {e}")))
}

/// Blocked id for an envelope that has no event id yet.
fn synthetic_id(envelope: &Envelope) -> String {
    let bytes = serde_json::to_vec(envelope).unwrap_or_default();
    hex::encode(&hashing::hash32(&bytes)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_store::db;
    use serde_json::json;

    async fn setup() -> sqlx::SqlitePool {
        let pool = db::open_in_memory().await.unwrap();
        db::run_migrations(&pool, []).await.unwrap();
        pool
    }

    fn dep(s: &str) -> DepRef {
        DepRef::parse(s).unwrap()
    }

    async fn store_event(
        conn: &mut SqliteConnection,
        id: EventId,
        event_type: &str,
        plaintext: serde_json::Value,
    ) {
        event_store::put(
            conn,
            &event_store::NewEvent {
                event_id: id,
                event_type,
                plaintext: Some(&plaintext),
                ciphertext: None,
                key_id: None,
                received_at: None,
                origin_ip: None,
                origin_port: None,
                stored_at: 1,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn resolves_event_backed_deps() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let peer_id = EventId::from_bytes([1; 16]);
        store_event(&mut txn, peer_id, "peer", json!({"type": "peer"})).await;

        let mut env = Envelope::default();
        env.event_plaintext = Some(json!({"type": "message"}));
        env.add_dep(dep(&format!("peer:{}", peer_id.to_hex())));

        let out = ResolveDeps.process(env, &mut txn).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].deps_included_and_valid);
        assert!(matches!(
            out[0].resolved_deps.values().next(),
            Some(ResolvedDep::Identity { .. }) | Some(ResolvedDep::ValidatedEvent { .. })
        ));
    }

    #[tokio::test]
    async fn missing_deps_park_and_emit_companion() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();

        let mut env = Envelope::default();
        env.event_id = Some(EventId::from_bytes([7; 16]));
        env.event_plaintext = Some(json!({"type": "message"}));
        env.add_dep(dep("peer:aa11"));

        let out = ResolveDeps.process(env, &mut txn).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].missing_deps);
        assert_eq!(out[0].missing_dep_list, vec![dep("peer:aa11")]);

        assert_eq!(blocked::count(&mut txn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unblock_rewakes_in_insertion_order_with_retry_bump() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let arrived = EventId::from_bytes([9; 16]);

        let parked_a = Envelope {
            event_plaintext: Some(json!({"tag": "a"})),
            retry_count: 2,
            ..Envelope::default()
        };
        let parked_b = Envelope {
            event_plaintext: Some(json!({"tag": "b"})),
            ..Envelope::default()
        };
        let missing = [dep(&format!("peer:{}", arrived.to_hex()))];
        blocked::park(&mut txn, "a", &parked_a, &missing, 10).await.unwrap();
        blocked::park(&mut txn, "b", &parked_b, &missing, 20).await.unwrap();

        let trigger = Envelope {
            event_id: Some(arrived),
            validated: true,
            stored: true,
            ..Envelope::default()
        };
        assert!(ResolveDeps.filter(&trigger));

        let out = ResolveDeps.process(trigger, &mut txn).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event_plaintext, Some(json!({"tag": "a"})));
        assert_eq!(out[0].retry_count, 3);
        assert!(out[0].unblocked);
        assert!(!out[0].deps_included_and_valid);
        assert_eq!(out[1].event_plaintext, Some(json!({"tag": "b"})));

        // Exactly one rewake per parked envelope.
        assert_eq!(blocked::count(&mut txn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purged_events_do_not_satisfy_deps() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let id = EventId::from_bytes([1; 16]);
        store_event(&mut txn, id, "peer", json!({"type": "peer"})).await;
        event_store::purge(&mut txn, id, "test", 0, 1000).await.unwrap();

        let mut env = Envelope::default();
        env.event_plaintext = Some(json!({"type": "message"}));
        env.add_dep(dep(&format!("peer:{}", id.to_hex())));

        let out = ResolveDeps.process(env, &mut txn).await.unwrap();
        assert!(out[0].missing_deps);
    }

    #[tokio::test]
    async fn kind_mismatch_is_fatal() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let id = EventId::from_bytes([1; 16]);
        store_event(&mut txn, id, "message", json!({"type": "message"})).await;

        let mut env = Envelope::default();
        env.event_plaintext = Some(json!({"type": "message"}));
        env.add_dep(dep(&format!("peer:{}", id.to_hex())));

        let err = ResolveDeps.process(env, &mut txn).await;
        assert!(matches!(err, Err(HandlerError::Malformed(_))));
    }

    #[tokio::test]
    async fn empty_deps_resolve_trivially() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();

        let env = Envelope {
            event_plaintext: Some(json!({"type": "identity"})),
            ..Envelope::default()
        };
        assert!(ResolveDeps.filter(&env));
        let out = ResolveDeps.process(env, &mut txn).await.unwrap();
        assert!(out[0].deps_included_and_valid);
    }
}
