//! Event layer: end-to-end encryption scoped to a group/channel key, plus
//! sealed-box key delivery.
//!
//! `key_ref` is the tagged union driving both directions: `{kind: key}` is
//! an AEAD under a symmetric event key, `{kind: peer}` is a sealed box to
//! one recipient. When the needed key is not yet in `resolved_deps` the
//! handler appends the dep and re-emits, which resets the resolution gate
//! and routes the envelope back through the resolver.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use coterie_core::{DepKind, DepRef, EventId, KeyId, Secret};
use coterie_crypto::CryptoCtx;
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, KeyRef, ResolvedDep};

use crate::canonical;

pub struct EventCrypto {
    crypto: CryptoCtx,
}

impl EventCrypto {
    pub fn new(crypto: CryptoCtx) -> Self {
        Self { crypto }
    }

    fn wants_decrypt(envelope: &Envelope) -> bool {
        envelope.deps_included_and_valid
            && !envelope.should_remove
            && envelope.key_ref.is_some()
            && envelope.event_plaintext.is_none()
            && !envelope.outgoing
    }

    fn wants_encrypt(envelope: &Envelope) -> bool {
        envelope.outgoing
            && envelope.outgoing_checked
            && envelope.deps_included_and_valid
            && envelope.event_plaintext.is_some()
            && envelope.event_ciphertext.is_none()
    }

    fn resolved_event_key(envelope: &Envelope, key_id: KeyId) -> Option<Secret> {
        let dep = DepRef::new(DepKind::Key, key_id.to_hex());
        match envelope.resolved(&dep)? {
            ResolvedDep::TransitKey { secret, .. } => Some(secret.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Handler for EventCrypto {
    fn name(&self) -> &'static str {
        "event_crypto"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        Self::wants_decrypt(envelope) || Self::wants_encrypt(envelope)
    }

    async fn process(
        &self,
        envelope: Envelope,
        _txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        if Self::wants_decrypt(&envelope) {
            self.decrypt(envelope)
        } else {
            self.encrypt(envelope)
        }
    }
}

impl EventCrypto {
    fn decrypt(&self, mut envelope: Envelope) -> Result<Vec<Envelope>, HandlerError> {
        let key_ref = envelope
            .key_ref
            .ok_or_else(|| HandlerError::Malformed("decrypt without key_ref".into()))?;
        let ciphertext = match &envelope.event_ciphertext {
            Some(ct) => ct.clone(),
            None => return Err(HandlerError::Malformed("decrypt without ciphertext".into())),
        };

        let padded = match key_ref {
            KeyRef::Key { key_id } => {
                let Some(secret) = Self::resolved_event_key(&envelope, key_id) else {
                    envelope.add_dep(DepRef::new(DepKind::Key, key_id.to_hex()));
                    return Ok(vec![envelope]);
                };
                match self.crypto.aead_decrypt(&secret, &ciphertext) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(event_id = ?envelope.event_id, error = %e, "event MAC failure, envelope dropped");
                        return Ok(vec![]);
                    }
                }
            }
            KeyRef::Peer { peer_id } => {
                let dep = DepRef::new(DepKind::Identity, peer_id.to_hex());
                let Some(resolved) = envelope.resolved(&dep) else {
                    envelope.add_dep(dep);
                    return Ok(vec![envelope]);
                };
                let seed = match resolved {
                    ResolvedDep::Identity {
                        local_metadata: Some(lm),
                        ..
                    } => lm.private_key.clone(),
                    _ => None,
                };
                let Some(seed) = seed else {
                    debug!(recipient = %peer_id, "sealed event for an identity we do not hold, dropped");
                    return Ok(vec![]);
                };
                match self.crypto.unseal(&seed, &ciphertext) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(event_id = ?envelope.event_id, error = %e, "unseal failure, envelope dropped");
                        return Ok(vec![]);
                    }
                }
            }
        };

        let plaintext = match canonical::parse_padded(&padded) {
            Ok(p) => p,
            Err(e) => {
                debug!(event_id = ?envelope.event_id, error = %e, "unparseable event body, dropped");
                return Ok(vec![]);
            }
        };

        if let KeyRef::Peer { .. } = key_ref {
            // Sealed key events are self-validating by unwrap, but the id
            // must still match the content address.
            let computed = canonical::compute_event_id(&plaintext)
                .map_err(|e| HandlerError::Malformed(e.to_string()))?;
            if envelope.event_id != Some(computed) {
                debug!(claimed = ?envelope.event_id, computed = %computed, "key event id mismatch, dropped");
                return Ok(vec![]);
            }
            envelope.sig_checked = true;
            envelope.validated = true;
        }

        envelope.event_type = plaintext
            .get("type")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        copy_plaintext_deps(&mut envelope, &plaintext)?;
        envelope.event_plaintext = Some(plaintext);

        Ok(vec![envelope])
    }

    fn encrypt(&self, mut envelope: Envelope) -> Result<Vec<Envelope>, HandlerError> {
        let plaintext = envelope
            .event_plaintext
            .clone()
            .ok_or_else(|| HandlerError::Malformed("encrypt without plaintext".into()))?;
        let padded = canonical::padded_canonical(&plaintext)
            .map_err(|e| HandlerError::Fatal(format!("canonical encode: {e}")))?;

        if envelope.kind() == Some("key") {
            let Some((dep, resolved)) = envelope.dep_of_kind(DepKind::Peer) else {
                return Err(HandlerError::Fatal("key event without recipient peer dep".into()));
            };
            let peer_id = EventId::from_hex(&dep.id)
                .map_err(|e| HandlerError::Malformed(format!("recipient id: {e}")))?;
            let seal_pub = resolved
                .and_then(ResolvedDep::plaintext)
                .and_then(|p| p.get("seal_pub"))
                .and_then(JsonValue::as_str)
                .and_then(decode_pub)
                .ok_or_else(|| HandlerError::Fatal("recipient peer has no seal_pub".into()))?;

            let ciphertext = self
                .crypto
                .seal(&seal_pub, &padded)
                .map_err(|e| HandlerError::Fatal(format!("seal: {e}")))?;
            envelope.event_ciphertext = Some(ciphertext);
            envelope.key_ref = Some(KeyRef::Peer { peer_id });
            return Ok(vec![envelope]);
        }

        let Some(key_id) = select_event_key(&envelope, &plaintext) else {
            return Err(HandlerError::Fatal("no event key for outbound event".into()));
        };

        let Some(secret) = Self::resolved_event_key(&envelope, key_id) else {
            envelope.add_dep(DepRef::new(DepKind::Key, key_id.to_hex()));
            return Ok(vec![envelope]);
        };

        let ciphertext = self
            .crypto
            .aead_encrypt(&secret, &padded)
            .map_err(|e| HandlerError::Fatal(format!("event encrypt: {e}")))?;
        envelope.event_ciphertext = Some(ciphertext);
        envelope.key_ref = Some(KeyRef::Key { key_id });

        Ok(vec![envelope])
    }
}

/// Which symmetric key encrypts this event: an explicit key_ref, the
/// event's own declared key, or the first resolved dep that names one
/// (channel and group events carry `key_id`).
fn select_event_key(envelope: &Envelope, plaintext: &JsonValue) -> Option<KeyId> {
    if let Some(KeyRef::Key { key_id }) = envelope.key_ref {
        return Some(key_id);
    }
    if let Some(own) = plaintext.get("key_id").and_then(JsonValue::as_str) {
        if let Ok(key_id) = KeyId::from_hex(own) {
            return Some(key_id);
        }
    }
    for dep in &envelope.deps {
        let declared = envelope
            .resolved(dep)
            .and_then(ResolvedDep::plaintext)
            .and_then(|p| p.get("key_id"))
            .and_then(JsonValue::as_str)
            .and_then(|s| KeyId::from_hex(s).ok());
        if declared.is_some() {
            return declared;
        }
    }
    None
}

/// Inbound events re-declare their prerequisites in `plaintext.deps`; those
/// become envelope deps, resetting the resolution gate.
fn copy_plaintext_deps(envelope: &mut Envelope, plaintext: &JsonValue) -> Result<(), HandlerError> {
    let Some(declared) = plaintext.get("deps") else {
        return Ok(());
    };
    let refs = declared
        .as_array()
        .ok_or_else(|| HandlerError::Malformed("plaintext deps is not an array".into()))?;
    for entry in refs {
        let text = entry
            .as_str()
            .ok_or_else(|| HandlerError::Malformed("plaintext dep is not a string".into()))?;
        let dep = DepRef::parse(text).map_err(|e| HandlerError::Malformed(e.to_string()))?;
        envelope.add_dep(dep);
    }
    Ok(())
}

fn decode_pub(hex_str: &str) -> Option<[u8; 32]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}
