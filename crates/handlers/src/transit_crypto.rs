//! Transit layer: hop-by-hop authenticated encryption.
//!
//! Pure with respect to the envelope; key material comes exclusively from
//! `resolved_deps`, never from the database.

use async_trait::async_trait;
use tracing::debug;

use coterie_core::{DepKind, DepRef, Secret};
use coterie_crypto::CryptoCtx;
use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError, ResolvedDep};

use crate::wire::TransitFrame;

pub struct TransitCrypto {
    crypto: CryptoCtx,
}

impl TransitCrypto {
    pub fn new(crypto: CryptoCtx) -> Self {
        Self { crypto }
    }

    fn wants_decrypt(envelope: &Envelope) -> bool {
        envelope.deps_included_and_valid
            && envelope.transit_key_id.is_some()
            && envelope.transit_ciphertext.is_some()
            && envelope.key_ref.is_none()
            && !envelope.outgoing
    }

    fn wants_encrypt(envelope: &Envelope) -> bool {
        envelope.outgoing
            && envelope.outgoing_checked
            && envelope.deps_included_and_valid
            && envelope.event_ciphertext.is_some()
            && envelope.transit_key_id.is_some()
            && envelope.transit_ciphertext.is_none()
    }

    fn transit_secret(envelope: &Envelope) -> Option<Secret> {
        let key_id = envelope.transit_key_id?;
        let dep = DepRef::new(DepKind::TransitKey, key_id.to_hex());
        match envelope.resolved(&dep)? {
            ResolvedDep::TransitKey { secret, .. } => Some(secret.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Handler for TransitCrypto {
    fn name(&self) -> &'static str {
        "transit_crypto"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        Self::wants_decrypt(envelope) || Self::wants_encrypt(envelope)
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let secret = Self::transit_secret(&envelope).ok_or_else(|| {
            HandlerError::Malformed("transit key dep resolved to wrong payload".into())
        })?;

        if Self::wants_decrypt(&envelope) {
            let ciphertext = envelope
                .transit_ciphertext
                .take()
                .ok_or_else(|| HandlerError::Malformed("transit_ciphertext vanished".into()))?;

            let frame_bytes = match self.crypto.aead_decrypt(&secret, &ciphertext) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(origin = ?envelope.origin_ip, error = %e, "transit MAC failure, envelope dropped");
                    return Ok(vec![]);
                }
            };
            let frame = match TransitFrame::decode(&frame_bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(origin = ?envelope.origin_ip, error = %e, "bad transit frame, envelope dropped");
                    return Ok(vec![]);
                }
            };

            envelope.transit_key_id = None;
            envelope.key_ref = Some(frame.key_ref);
            envelope.event_id = Some(frame.event_id);
            envelope.network_id = frame.network_id;
            envelope.event_ciphertext = Some(frame.body);

            Ok(vec![envelope])
        } else {
            let event_id = envelope
                .event_id
                .ok_or_else(|| HandlerError::Malformed("outbound envelope without event_id".into()))?;
            let key_ref = envelope
                .key_ref
                .ok_or_else(|| HandlerError::Malformed("outbound envelope without key_ref".into()))?;
            let body = envelope
                .event_ciphertext
                .clone()
                .ok_or_else(|| HandlerError::Malformed("event_ciphertext vanished".into()))?;

            let frame = TransitFrame {
                key_ref,
                event_id,
                network_id: envelope.network_id,
                body,
            };
            let frame_bytes = frame
                .encode()
                .map_err(|e| HandlerError::Fatal(format!("frame encode: {e}")))?;

            let ciphertext = self
                .crypto
                .aead_encrypt(&secret, &frame_bytes)
                .map_err(|e| HandlerError::Fatal(format!("transit encrypt: {e}")))?;

            envelope.transit_ciphertext = Some(ciphertext);
            Ok(vec![envelope])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::{EventId, KeyId};
    use coterie_crypto::CryptoMode;
    use coterie_pipeline::KeyRef;

    async fn txn_pool() -> sqlx::SqlitePool {
        sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    fn ctx() -> CryptoCtx {
        CryptoCtx::new(CryptoMode::Dummy)
    }

    fn with_transit_key(mut envelope: Envelope, key_id: KeyId, secret: &Secret) -> Envelope {
        envelope.transit_key_id = Some(key_id);
        let dep = DepRef::new(DepKind::TransitKey, key_id.to_hex());
        envelope.resolved_deps.insert(
            dep.to_string(),
            ResolvedDep::TransitKey {
                key_id,
                secret: secret.clone(),
                network_id: None,
            },
        );
        envelope.deps.push(dep);
        envelope.deps_included_and_valid = true;
        envelope
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips_the_frame() {
        let pool = txn_pool().await;
        let handler = TransitCrypto::new(ctx());
        let secret = Secret::from_bytes([1; 32]);
        let key_id = KeyId::from_bytes([2; 32]);
        let event_id = EventId::from_bytes([3; 16]);

        // Outbound leg.
        let mut outbound = with_transit_key(Envelope::default(), key_id, &secret);
        outbound.outgoing = true;
        outbound.outgoing_checked = true;
        outbound.event_ciphertext = Some(vec![9, 9, 9]);
        outbound.event_id = Some(event_id);
        outbound.key_ref = Some(KeyRef::Key {
            key_id: KeyId::from_bytes([4; 32]),
        });
        assert!(handler.filter(&outbound));

        let mut txn = pool.begin().await.unwrap();
        let sent = handler.process(outbound, &mut txn).await.unwrap();
        let transit_ct = sent[0].transit_ciphertext.clone().unwrap();

        // Inbound leg.
        let mut inbound = with_transit_key(Envelope::default(), key_id, &secret);
        inbound.transit_ciphertext = Some(transit_ct);
        assert!(handler.filter(&inbound));

        let got = handler.process(inbound, &mut txn).await.unwrap();
        let env = &got[0];
        assert_eq!(env.event_ciphertext, Some(vec![9, 9, 9]));
        assert_eq!(env.event_id, Some(event_id));
        assert!(env.transit_ciphertext.is_none());
        assert!(matches!(env.key_ref, Some(KeyRef::Key { .. })));
    }

    #[tokio::test]
    async fn wrong_transit_key_drops_silently() {
        let pool = txn_pool().await;
        let handler = TransitCrypto::new(ctx());
        let key_id = KeyId::from_bytes([2; 32]);

        let mut envelope =
            with_transit_key(Envelope::default(), key_id, &Secret::from_bytes([8; 32]));
        envelope.transit_ciphertext = Some(vec![0; 64]);

        let mut txn = pool.begin().await.unwrap();
        let out = handler.process(envelope, &mut txn).await.unwrap();
        assert!(out.is_empty());
    }
}
