//! Event signing and verification.
//!
//! Signing covers the canonical plaintext without the `signature` field;
//! the event id is BLAKE2b-128 of the padded signed form and is assigned
//! here, immediately after signing. `key` events are sealed, not signed,
//! and are rejected by both arms.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use coterie_core::{DepKind, EventId, Secret};
use coterie_crypto::CryptoCtx;
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, ResolvedDep};

use crate::canonical;

pub struct Signature {
    crypto: CryptoCtx,
}

impl Signature {
    pub fn new(crypto: CryptoCtx) -> Self {
        Self { crypto }
    }

    fn wants_sign(envelope: &Envelope) -> bool {
        envelope.self_created
            && envelope.deps_included_and_valid
            && envelope.event_plaintext.is_some()
            && !envelope.has_signature()
            && envelope.event_id.is_none()
            && envelope.kind() != Some("key")
    }

    fn wants_verify(envelope: &Envelope) -> bool {
        !envelope.self_created
            && envelope.deps_included_and_valid
            && envelope.event_plaintext.is_some()
            && !envelope.sig_checked
            && envelope.kind() != Some("key")
    }

    /// The seed that signs this envelope: carried local metadata for
    /// identity bootstraps, otherwise the resolved identity dep.
    fn signing_seed(envelope: &Envelope) -> Option<Secret> {
        if let Some(seed) = envelope
            .local_metadata
            .as_ref()
            .and_then(|lm| lm.private_key.clone())
        {
            return Some(seed);
        }
        match envelope.resolved_of_kind(DepKind::Identity)? {
            ResolvedDep::Identity {
                local_metadata: Some(lm),
                ..
            } => lm.private_key.clone(),
            _ => None,
        }
    }

    /// The public key that verifies this envelope: the author's peer dep,
    /// or the plaintext's own `sign_pub` for self-certifying records
    /// (identity, peer, group).
    fn verifying_key(envelope: &Envelope, plaintext: &JsonValue) -> Option<[u8; 32]> {
        let from_peer = envelope
            .resolved_of_kind(DepKind::Peer)
            .and_then(ResolvedDep::plaintext)
            .and_then(|p| p.get("sign_pub"))
            .and_then(JsonValue::as_str)
            .and_then(decode_pub);
        if from_peer.is_some() {
            return from_peer;
        }
        plaintext
            .get("sign_pub")
            .and_then(JsonValue::as_str)
            .and_then(decode_pub)
    }
}

#[async_trait]
impl Handler for Signature {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        Self::wants_sign(envelope) || Self::wants_verify(envelope)
    }

    async fn process(
        &self,
        envelope: Envelope,
        _txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        if Self::wants_sign(&envelope) {
            self.sign(envelope)
        } else {
            self.verify(envelope)
        }
    }
}

impl Signature {
    fn sign(&self, mut envelope: Envelope) -> Result<Vec<Envelope>, HandlerError> {
        let seed = Self::signing_seed(&envelope)
            .ok_or_else(|| HandlerError::Fatal("no signing key for self-created event".into()))?;

        let mut plaintext = envelope
            .event_plaintext
            .take()
            .ok_or_else(|| HandlerError::Malformed("sign without plaintext".into()))?;

        let input = canonical::signing_input(&plaintext)
            .map_err(|e| HandlerError::Fatal(format!("canonical encode: {e}")))?;
        let signature = self.crypto.sign(&seed, &input);

        let object = plaintext
            .as_object_mut()
            .ok_or_else(|| HandlerError::Malformed("plaintext is not an object".into()))?;
        object.insert("signature".into(), JsonValue::from(hex::encode(signature)));

        let event_id = canonical::compute_event_id(&plaintext)
            .map_err(|e| HandlerError::Fatal(format!("canonical encode: {e}")))?;

        annotate_attribution(&mut envelope, &plaintext, event_id);
        envelope.event_id = Some(event_id);
        envelope.sig_checked = true;
        envelope.event_plaintext = Some(plaintext);

        Ok(vec![envelope])
    }

    fn verify(&self, mut envelope: Envelope) -> Result<Vec<Envelope>, HandlerError> {
        let plaintext = envelope
            .event_plaintext
            .clone()
            .ok_or_else(|| HandlerError::Malformed("verify without plaintext".into()))?;

        let Some(signature) = plaintext
            .get("signature")
            .and_then(JsonValue::as_str)
            .and_then(decode_sig)
        else {
            debug!(event_id = ?envelope.event_id, "unsigned event dropped");
            return Ok(vec![]);
        };

        let Some(public) = Self::verifying_key(&envelope, &plaintext) else {
            debug!(event_id = ?envelope.event_id, "no verifying key available, dropped");
            return Ok(vec![]);
        };

        let input = canonical::signing_input(&plaintext)
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;
        if let Err(e) = self.crypto.verify(&public, &input, &signature) {
            debug!(event_id = ?envelope.event_id, error = %e, "signature verification failed, dropped");
            return Ok(vec![]);
        }

        let computed = canonical::compute_event_id(&plaintext)
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;
        if let Some(claimed) = envelope.event_id {
            if claimed != computed {
                debug!(%claimed, %computed, "event id mismatch, dropped");
                return Ok(vec![]);
            }
        }

        annotate_attribution(&mut envelope, &plaintext, computed);
        envelope.event_id = Some(computed);
        envelope.sig_checked = true;

        Ok(vec![envelope])
    }
}

fn annotate_attribution(envelope: &mut Envelope, plaintext: &JsonValue, event_id: EventId) {
    if envelope.peer_id.is_none() {
        envelope.peer_id = plaintext
            .get("peer_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| EventId::from_hex(s).ok())
            // Author attribution rides in the first peer dep.
            .or_else(|| {
                let dep = envelope.deps.iter().find(|d| d.kind == DepKind::Peer)?;
                EventId::from_hex(&dep.id).ok()
            })
            // A peer event's own id is its peer id.
            .or_else(|| (plaintext.get("type")?.as_str()? == "peer").then_some(event_id));
    }
    if envelope.network_id.is_none() {
        // The bootstrap group doubles as the network, so group-scoped
        // events attribute to their group.
        envelope.network_id = plaintext
            .get("network_id")
            .or_else(|| plaintext.get("group_id"))
            .and_then(JsonValue::as_str)
            .and_then(|s| EventId::from_hex(s).ok());
    }
}

fn decode_pub(hex_str: &str) -> Option<[u8; 32]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}

fn decode_sig(hex_str: &str) -> Option<[u8; 64]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::DepRef;
    use coterie_pipeline::LocalMetadata;
    use coterie_crypto::CryptoMode;
    use serde_json::json;

    async fn txn_pool() -> sqlx::SqlitePool {
        sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    fn ctx() -> CryptoCtx {
        CryptoCtx::new(CryptoMode::Dummy)
    }

    fn self_created(plaintext: JsonValue, seed: &Secret) -> Envelope {
        Envelope {
            self_created: true,
            deps_included_and_valid: true,
            event_plaintext: Some(plaintext),
            local_metadata: Some(LocalMetadata {
                private_key: Some(seed.clone()),
                ..Default::default()
            }),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn sign_assigns_id_and_round_trips_through_verify() {
        let pool = txn_pool().await;
        let handler = Signature::new(ctx());
        let seed = Secret::from_bytes([1; 32]);
        let sign_pub = hex::encode(ctx().signing_public_key(&seed));

        let envelope = self_created(
            json!({"type": "peer", "sign_pub": sign_pub, "deps": []}),
            &seed,
        );
        assert!(handler.filter(&envelope));

        let mut txn = pool.begin().await.unwrap();
        let signed = handler.process(envelope, &mut txn).await.unwrap();
        let env = &signed[0];
        assert!(env.sig_checked);
        let event_id = env.event_id.unwrap();
        assert!(env.has_signature());
        // Peer events are attributed to their own id.
        assert_eq!(env.peer_id, Some(event_id));

        // Simulate the remote side: same plaintext, not self-created.
        let inbound = Envelope {
            deps_included_and_valid: true,
            event_plaintext: env.event_plaintext.clone(),
            event_id: Some(event_id),
            ..Envelope::default()
        };
        assert!(handler.filter(&inbound));
        let verified = handler.process(inbound, &mut txn).await.unwrap();
        assert!(verified[0].sig_checked);
        assert_eq!(verified[0].event_id, Some(event_id));
    }

    #[tokio::test]
    async fn tampered_plaintext_fails_verification() {
        let pool = txn_pool().await;
        let handler = Signature::new(ctx());
        let seed = Secret::from_bytes([1; 32]);
        let sign_pub = hex::encode(ctx().signing_public_key(&seed));

        let mut txn = pool.begin().await.unwrap();
        let signed = handler
            .process(
                self_created(json!({"type": "peer", "sign_pub": sign_pub, "deps": []}), &seed),
                &mut txn,
            )
            .await
            .unwrap();

        let mut tampered_plaintext = signed[0].event_plaintext.clone().unwrap();
        tampered_plaintext["sign_pub"] = json!(hex::encode([0u8; 32]));
        let inbound = Envelope {
            deps_included_and_valid: true,
            event_plaintext: Some(tampered_plaintext),
            ..Envelope::default()
        };

        let out = handler.process(inbound, &mut txn).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn verify_uses_the_resolved_peer_dep() {
        let pool = txn_pool().await;
        let handler = Signature::new(ctx());
        let seed = Secret::from_bytes([2; 32]);
        let author_peer = EventId::from_bytes([7; 16]);
        let sign_pub = hex::encode(ctx().signing_public_key(&seed));

        // Author signs a message (no embedded sign_pub).
        let mut txn = pool.begin().await.unwrap();
        let mut envelope = self_created(
            json!({"type": "message", "content": "hi", "peer_id": author_peer.to_hex(), "deps": []}),
            &seed,
        );
        envelope.local_metadata = Some(LocalMetadata {
            private_key: Some(seed.clone()),
            ..Default::default()
        });
        let signed = handler.process(envelope, &mut txn).await.unwrap();

        // Receiver resolves the author's peer record.
        let peer_dep = DepRef::new(DepKind::Peer, author_peer.to_hex());
        let mut inbound = Envelope {
            deps_included_and_valid: true,
            event_plaintext: signed[0].event_plaintext.clone(),
            ..Envelope::default()
        };
        inbound.deps.push(peer_dep.clone());
        inbound.resolved_deps.insert(
            peer_dep.to_string(),
            ResolvedDep::Identity {
                event_id: author_peer,
                plaintext: json!({"type": "peer", "sign_pub": sign_pub}),
                local_metadata: None,
            },
        );

        let out = handler.process(inbound, &mut txn).await.unwrap();
        assert!(out[0].sig_checked);
        assert_eq!(out[0].peer_id, Some(author_peer));
    }

    #[tokio::test]
    async fn key_events_are_not_signed_or_verified() {
        let handler = Signature::new(ctx());
        let envelope = Envelope {
            self_created: true,
            deps_included_and_valid: true,
            event_plaintext: Some(json!({"type": "key", "deps": []})),
            ..Envelope::default()
        };
        assert!(!handler.filter(&envelope));

        let inbound = Envelope {
            deps_included_and_valid: true,
            event_plaintext: Some(json!({"type": "key", "deps": []})),
            ..Envelope::default()
        };
        assert!(!handler.filter(&inbound));
    }
}
