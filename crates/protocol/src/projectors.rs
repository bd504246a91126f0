//! Per-type projectors: validated events → read-model deltas.
//!
//! Upserts keyed by event id make projection idempotent; a replay of the
//! same event converges to the same row. Schemas declared here are created
//! by the store at startup; nothing but the delta applier writes them.

use std::sync::Arc;

use serde_json::{json, Map, Value as JsonValue};

use coterie_pipeline::{Delta, Envelope, ProjectionError, Projector};

use crate::events;

pub fn all() -> Vec<Arc<dyn Projector>> {
    vec![
        Arc::new(IdentitiesProjector),
        Arc::new(GroupsProjector),
        Arc::new(PeersProjector),
        Arc::new(UsersProjector),
        Arc::new(InvitesProjector),
        Arc::new(ChannelsProjector),
        Arc::new(MessagesProjector),
        Arc::new(ReceiptsProjector),
    ]
}

fn event_id_hex(envelope: &Envelope) -> Result<String, ProjectionError> {
    envelope
        .event_id
        .map(|id| id.to_hex())
        .ok_or_else(|| ProjectionError::Failed("envelope has no event_id".into()))
}

fn field(envelope: &Envelope, key: &str) -> Result<JsonValue, ProjectionError> {
    envelope
        .event_plaintext
        .as_ref()
        .and_then(|p| p.get(key))
        .cloned()
        .ok_or_else(|| ProjectionError::Failed(format!("plaintext missing {key}")))
}

fn row(pairs: Vec<(&str, JsonValue)>) -> Map<String, JsonValue> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub struct IdentitiesProjector;

impl Projector for IdentitiesProjector {
    fn event_type(&self) -> &'static str {
        events::IDENTITY
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            identity_id TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            sign_pub    TEXT NOT NULL,
            seal_pub    TEXT NOT NULL,
            created_at  INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "identities",
            row(vec![
                ("identity_id", json!(event_id_hex(envelope)?)),
                ("name", field(envelope, "name")?),
                ("sign_pub", field(envelope, "sign_pub")?),
                ("seal_pub", field(envelope, "seal_pub")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

pub struct GroupsProjector;

impl Projector for GroupsProjector {
    fn event_type(&self) -> &'static str {
        events::GROUP
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            group_id   TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            key_id     TEXT NOT NULL,
            created_at INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "groups",
            row(vec![
                ("group_id", json!(event_id_hex(envelope)?)),
                ("name", field(envelope, "name")?),
                ("key_id", field(envelope, "key_id")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

pub struct PeersProjector;

impl Projector for PeersProjector {
    fn event_type(&self) -> &'static str {
        events::PEER
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS peers (
            peer_id     TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL,
            network_id  TEXT NOT NULL,
            sign_pub    TEXT NOT NULL,
            seal_pub    TEXT NOT NULL,
            created_at  INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "peers",
            row(vec![
                ("peer_id", json!(event_id_hex(envelope)?)),
                ("identity_id", field(envelope, "identity_id")?),
                ("network_id", field(envelope, "network_id")?),
                ("sign_pub", field(envelope, "sign_pub")?),
                ("seal_pub", field(envelope, "seal_pub")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

/// Users also maintain the membership table the pipeline's membership gate
/// checks against.
pub struct UsersProjector;

impl Projector for UsersProjector {
    fn event_type(&self) -> &'static str {
        events::USER
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id    TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            peer_id    TEXT NOT NULL,
            group_id   TEXT NOT NULL,
            created_at INTEGER
        );
        CREATE TABLE IF NOT EXISTS group_members (
            member_id TEXT NOT NULL,
            group_id  TEXT NOT NULL,
            peer_id   TEXT NOT NULL,
            joined_at INTEGER,
            PRIMARY KEY (member_id, group_id)
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        let user_id = event_id_hex(envelope)?;
        Ok(vec![
            Delta::upsert(
                "users",
                row(vec![
                    ("user_id", json!(user_id)),
                    ("name", field(envelope, "name")?),
                    ("peer_id", field(envelope, "peer_id")?),
                    ("group_id", field(envelope, "group_id")?),
                    ("created_at", field(envelope, "created_at_ms")?),
                ]),
            ),
            Delta::upsert(
                "group_members",
                row(vec![
                    ("member_id", json!(user_id)),
                    ("group_id", field(envelope, "group_id")?),
                    ("peer_id", field(envelope, "peer_id")?),
                    ("joined_at", field(envelope, "created_at_ms")?),
                ]),
            ),
        ])
    }
}

pub struct InvitesProjector;

impl Projector for InvitesProjector {
    fn event_type(&self) -> &'static str {
        events::INVITE
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS invites (
            invite_id   TEXT PRIMARY KEY,
            invite_code TEXT NOT NULL,
            group_id    TEXT NOT NULL,
            key_id      TEXT NOT NULL,
            created_at  INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "invites",
            row(vec![
                ("invite_id", json!(event_id_hex(envelope)?)),
                ("invite_code", field(envelope, "invite_code")?),
                ("group_id", field(envelope, "group_id")?),
                ("key_id", field(envelope, "key_id")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

pub struct ChannelsProjector;

impl Projector for ChannelsProjector {
    fn event_type(&self) -> &'static str {
        events::CHANNEL
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            group_id   TEXT NOT NULL,
            name       TEXT NOT NULL,
            key_id     TEXT NOT NULL,
            created_at INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "channels",
            row(vec![
                ("channel_id", json!(event_id_hex(envelope)?)),
                ("group_id", field(envelope, "group_id")?),
                ("name", field(envelope, "name")?),
                ("key_id", field(envelope, "key_id")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

pub struct MessagesProjector;

impl Projector for MessagesProjector {
    fn event_type(&self) -> &'static str {
        events::MESSAGE
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            message_id       TEXT PRIMARY KEY,
            channel_id       TEXT NOT NULL,
            group_id         TEXT NOT NULL,
            peer_id          TEXT,
            sender_member_id TEXT NOT NULL,
            content          TEXT NOT NULL,
            created_at       INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id, created_at);
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "messages",
            row(vec![
                ("message_id", json!(event_id_hex(envelope)?)),
                ("channel_id", field(envelope, "channel_id")?),
                ("group_id", field(envelope, "group_id")?),
                (
                    "peer_id",
                    envelope
                        .peer_id
                        .map(|p| json!(p.to_hex()))
                        .unwrap_or(JsonValue::Null),
                ),
                ("sender_member_id", field(envelope, "group_member_id")?),
                ("content", field(envelope, "content")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

pub struct ReceiptsProjector;

impl Projector for ReceiptsProjector {
    fn event_type(&self) -> &'static str {
        events::RECEIPT
    }

    fn schema(&self) -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            receipt_id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            peer_id    TEXT NOT NULL,
            created_at INTEGER
        );
        "#
    }

    fn project(&self, envelope: &Envelope) -> Result<Vec<Delta>, ProjectionError> {
        Ok(vec![Delta::upsert(
            "receipts",
            row(vec![
                ("receipt_id", json!(event_id_hex(envelope)?)),
                ("message_id", field(envelope, "message_id")?),
                ("peer_id", field(envelope, "peer_id")?),
                ("created_at", field(envelope, "created_at_ms")?),
            ]),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::EventId;
    use coterie_store::{applier, ReadOnlyDb};
    use serde_json::json;

    fn validated(plaintext: JsonValue, id: u8) -> Envelope {
        Envelope {
            validated: true,
            stored: true,
            keys_stored: true,
            event_id: Some(EventId::from_bytes([id; 16])),
            peer_id: Some(EventId::from_bytes([id; 16])),
            event_plaintext: Some(plaintext),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn projector_deltas_applied_then_queried_yield_the_data() {
        let pool = coterie_store::open_in_memory().await.unwrap();
        let schemas: Vec<&str> = all().iter().map(|p| p.schema()).collect();
        coterie_store::run_migrations(&pool, schemas).await.unwrap();

        let channel = EventId::from_bytes([9; 16]);
        let group = EventId::from_bytes([8; 16]);
        let member = EventId::from_bytes([7; 16]);
        let peer = EventId::from_bytes([3; 16]);
        let envelope = validated(
            events::message("hi there", channel, group, peer, member, 1_000),
            3,
        );

        let deltas = MessagesProjector.project(&envelope).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        applier::apply(&mut conn, &deltas).await.unwrap();
        // Idempotent: replaying converges to the same row.
        applier::apply(&mut conn, &deltas).await.unwrap();
        drop(conn);

        let db = ReadOnlyDb::new(pool);
        let rows = db
            .query(
                "SELECT message_id, content FROM messages WHERE channel_id = ?1",
                &[json!(channel.to_hex())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"], json!("hi there"));
        assert_eq!(rows[0]["message_id"], json!(EventId::from_bytes([3; 16]).to_hex()));
    }

    #[tokio::test]
    async fn user_projection_feeds_the_membership_table() {
        let pool = coterie_store::open_in_memory().await.unwrap();
        let schemas: Vec<&str> = all().iter().map(|p| p.schema()).collect();
        coterie_store::run_migrations(&pool, schemas).await.unwrap();

        let peer = EventId::from_bytes([2; 16]);
        let group = EventId::from_bytes([8; 16]);
        let envelope = validated(events::user("alice", peer, group, "code", 1_000), 5);

        let deltas = UsersProjector.project(&envelope).unwrap();
        assert_eq!(deltas.len(), 2);
        let mut conn = pool.acquire().await.unwrap();
        applier::apply(&mut conn, &deltas).await.unwrap();
        drop(conn);

        let db = ReadOnlyDb::new(pool);
        let rows = db
            .query(
                "SELECT peer_id FROM group_members WHERE group_id = ?1",
                &[json!(group.to_hex())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["peer_id"], json!(peer.to_hex()));
    }

    #[test]
    fn missing_fields_surface_as_projection_errors() {
        let envelope = validated(json!({"type": "message"}), 1);
        assert!(MessagesProjector.project(&envelope).is_err());
    }

    #[test]
    fn same_deltas_replay_against_the_dictionary_applier() {
        use coterie_pipeline::MemoryApplier;

        let peer = EventId::from_bytes([2; 16]);
        let group = EventId::from_bytes([8; 16]);
        let envelope = validated(events::user("alice", peer, group, "code", 1_000), 5);
        let deltas = UsersProjector.project(&envelope).unwrap();

        let mut applier = MemoryApplier::new()
            .with_key("users", "user_id")
            .with_key("group_members", "member_id");
        applier.apply(&deltas).unwrap();
        // Replay converges, same as the SQL applier's upserts.
        applier.apply(&deltas).unwrap();

        assert_eq!(applier.rows("users").len(), 1);
        assert_eq!(applier.rows("users")[0]["name"], json!("alice"));
        assert_eq!(applier.rows("group_members").len(), 1);
        assert_eq!(
            applier.rows("group_members")[0]["peer_id"],
            json!(peer.to_hex())
        );
    }
}
