//! Group membership gate.
//!
//! Group-scoped events claim a membership: `group_member_id` is the user
//! event that admitted the author's peer to `group_id`. The claim is checked
//! against the projected `group_members` table (declared by the user
//! projector); a mismatch drops the envelope. Events without the claim
//! (membership-creating user events, local records) pass through untouched.

use async_trait::async_trait;
use sqlx::Row;
use tracing::warn;

use coterie_pipeline::{DbTxn, Envelope, Handler, HandlerError};

pub struct Membership;

impl Membership {
    fn claim(envelope: &Envelope) -> Option<(&str, &str)> {
        let plaintext = envelope.event_plaintext.as_ref()?;
        let group_id = plaintext.get("group_id")?.as_str()?;
        let member_id = plaintext.get("group_member_id")?.as_str()?;
        Some((group_id, member_id))
    }
}

#[async_trait]
impl Handler for Membership {
    fn name(&self) -> &'static str {
        "membership"
    }

    fn filter(&self, envelope: &Envelope) -> bool {
        envelope.sig_checked
            && !envelope.validated
            && !envelope.is_group_member
            && Self::claim(envelope).is_some()
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        txn: &mut DbTxn<'_>,
    ) -> Result<Vec<Envelope>, HandlerError> {
        let (group_id, member_id) = Self::claim(&envelope)
            .map(|(g, m)| (g.to_string(), m.to_string()))
            .ok_or_else(|| HandlerError::Malformed("membership claim vanished".into()))?;

        let row = sqlx::query(
            "SELECT peer_id FROM group_members WHERE member_id = ?1 AND group_id = ?2",
        )
        .bind(&member_id)
        .bind(&group_id)
        .fetch_optional(&mut **txn)
        .await?;

        let Some(row) = row else {
            warn!(group_id, member_id, "membership claim not found, envelope dropped");
            return Ok(vec![]);
        };

        // The author peer was pinned by the signature handler (from the
        // signed peer dep), so this binds the membership row to the key
        // that actually signed the event.
        let member_peer: String = row.try_get("peer_id")?;
        let claimed_peer = envelope
            .peer_id
            .map(|p| p.to_hex())
            .unwrap_or_default();

        if member_peer != claimed_peer {
            warn!(
                group_id,
                member_id,
                member_peer,
                claimed_peer,
                "membership claim names a different peer, envelope dropped"
            );
            return Ok(vec![]);
        }

        envelope.is_group_member = true;
        Ok(vec![envelope])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MEMBERS_SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS group_members (
            member_id TEXT NOT NULL,
            group_id  TEXT NOT NULL,
            peer_id   TEXT NOT NULL,
            joined_at INTEGER,
            PRIMARY KEY (member_id, group_id)
        );
    "#;

    fn peer_id(tag: u8) -> coterie_core::EventId {
        coterie_core::EventId::from_bytes([tag; 16])
    }

    async fn setup() -> sqlx::SqlitePool {
        let pool = coterie_store::open_in_memory().await.unwrap();
        coterie_store::run_migrations(&pool, [MEMBERS_SCHEMA]).await.unwrap();
        sqlx::query(
            "INSERT INTO group_members (member_id, group_id, peer_id, joined_at) VALUES ('m1', 'g1', ?1, 0)",
        )
        .bind(peer_id(1).to_hex())
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn scoped(member: &str, peer: u8) -> Envelope {
        Envelope {
            sig_checked: true,
            peer_id: Some(peer_id(peer)),
            event_plaintext: Some(json!({
                "type": "message",
                "group_id": "g1",
                "group_member_id": member,
            })),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn valid_membership_sets_the_flag() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let envelope = scoped("m1", 1);
        assert!(Membership.filter(&envelope));

        let out = Membership.process(envelope, &mut txn).await.unwrap();
        assert!(out[0].is_group_member);
    }

    #[tokio::test]
    async fn unknown_member_is_dropped() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let out = Membership.process(scoped("m9", 1), &mut txn).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn peer_mismatch_is_dropped() {
        let pool = setup().await;
        let mut txn = pool.begin().await.unwrap();
        let out = Membership.process(scoped("m1", 9), &mut txn).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn events_without_a_claim_are_not_matched() {
        let envelope = Envelope {
            sig_checked: true,
            event_plaintext: Some(json!({"type": "user", "group_id": "g1"})),
            ..Envelope::default()
        };
        assert!(!Membership.filter(&envelope));
    }
}
