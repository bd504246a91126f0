//! The event store: a persistent keyed blob store for canonical events.
//!
//! Write-once per `event_id`; `put` is idempotent and re-stores are no-ops.
//! Purged events keep their id row for duplicate rejection but lose their
//! bodies and never satisfy a dependency.

use serde_json::Value as JsonValue;
use sqlx::{Row, SqliteConnection};

use coterie_core::{EventId, KeyId};

use crate::error::StoreError;

/// An event about to be stored (post-validation).
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub event_id: EventId,
    pub event_type: &'a str,
    pub plaintext: Option<&'a JsonValue>,
    pub ciphertext: Option<&'a [u8]>,
    pub key_id: Option<KeyId>,
    pub received_at: Option<i64>,
    pub origin_ip: Option<&'a str>,
    pub origin_port: Option<u16>,
    pub stored_at: i64,
}

/// A stored event row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub plaintext: Option<JsonValue>,
    pub ciphertext: Option<Vec<u8>>,
    pub key_id: Option<KeyId>,
    pub received_at: Option<i64>,
    pub origin_ip: Option<String>,
    pub origin_port: Option<u16>,
    pub stored_at: i64,
    pub purged: bool,
    pub purged_at: Option<i64>,
    pub ttl_expire_at: Option<i64>,
}

/// Store an event. Returns `false` when the id already existed (including
/// purged tombstones); the row is left untouched in that case.
pub async fn put(conn: &mut SqliteConnection, event: &NewEvent<'_>) -> Result<bool, StoreError> {
    let plaintext = event
        .plaintext
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Serde(e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT INTO events (
            event_id, event_type, event_ciphertext, event_plaintext, key_id,
            received_at, origin_ip, origin_port, stored_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event.event_id.to_hex())
    .bind(event.event_type)
    .bind(event.ciphertext.map(hex::encode))
    .bind(plaintext)
    .bind(event.key_id.map(|k| k.to_hex()))
    .bind(event.received_at)
    .bind(event.origin_ip)
    .bind(event.origin_port.map(i64::from))
    .bind(event.stored_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn exists(conn: &mut SqliteConnection, event_id: EventId) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM events WHERE event_id = ?1")
        .bind(event_id.to_hex())
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some())
}

pub async fn get(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Option<StoredEvent>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT event_id, event_type, event_ciphertext, event_plaintext, key_id,
               received_at, origin_ip, origin_port, stored_at, purged, purged_at,
               ttl_expire_at
        FROM events
        WHERE event_id = ?1
        "#,
    )
    .bind(event_id.to_hex())
    .fetch_optional(conn)
    .await?;

    row.map(decode_row).transpose()
}

/// Fetch an event only if it is stored and not purged: the form dependencies
/// resolve against.
pub async fn get_validated(
    conn: &mut SqliteConnection,
    id_hex: &str,
) -> Result<Option<StoredEvent>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT event_id, event_type, event_ciphertext, event_plaintext, key_id,
               received_at, origin_ip, origin_port, stored_at, purged, purged_at,
               ttl_expire_at
        FROM events
        WHERE event_id = ?1 AND purged = 0
        "#,
    )
    .bind(id_hex)
    .fetch_optional(conn)
    .await?;

    row.map(decode_row).transpose()
}

/// Mark an event purged: bodies cleared, id retained, TTL scheduled.
pub async fn purge(
    conn: &mut SqliteConnection,
    event_id: EventId,
    reason: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE events
        SET purged = 1,
            purged_at = ?2,
            purge_reason = ?3,
            ttl_expire_at = ?4,
            event_plaintext = NULL,
            event_ciphertext = NULL
        WHERE event_id = ?1
        "#,
    )
    .bind(event_id.to_hex())
    .bind(now_ms)
    .bind(reason)
    .bind(now_ms + ttl_ms)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a rejected event that was never stored, so future ingress of the
/// same id is deduplicated. The row is born purged.
pub async fn put_tombstone(
    conn: &mut SqliteConnection,
    event_id: EventId,
    event_type: &str,
    reason: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (event_id, event_type, stored_at, purged, purged_at, purge_reason, ttl_expire_at)
        VALUES (?1, ?2, ?3, 1, ?3, ?4, ?5)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event_id.to_hex())
    .bind(event_type)
    .bind(now_ms)
    .bind(reason)
    .bind(now_ms + ttl_ms)
    .execute(conn)
    .await?;
    Ok(())
}

/// All purged ids with their expiry, oldest first.
pub async fn tombstones(
    conn: &mut SqliteConnection,
) -> Result<Vec<(EventId, Option<i64>)>, StoreError> {
    let rows = sqlx::query(
        "SELECT event_id, ttl_expire_at FROM events WHERE purged = 1 ORDER BY purged_at ASC",
    )
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            let id: String = row.try_get("event_id")?;
            let expiry: Option<i64> = row.try_get("ttl_expire_at")?;
            Ok((
                EventId::from_hex(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                expiry,
            ))
        })
        .collect()
}

/// Delete tombstones whose TTL expired before `before_ms`. Returns rows removed.
pub async fn delete_expired_tombstones(
    conn: &mut SqliteConnection,
    before_ms: i64,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "DELETE FROM events WHERE purged = 1 AND ttl_expire_at IS NOT NULL AND ttl_expire_at < ?1",
    )
    .bind(before_ms)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// All non-purged events of a type, oldest first.
pub async fn list_by_type(
    conn: &mut SqliteConnection,
    event_type: &str,
) -> Result<Vec<StoredEvent>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT event_id, event_type, event_ciphertext, event_plaintext, key_id,
               received_at, origin_ip, origin_port, stored_at, purged, purged_at,
               ttl_expire_at
        FROM events
        WHERE event_type = ?1 AND purged = 0
        ORDER BY stored_at ASC, event_id ASC
        "#,
    )
    .bind(event_type)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(decode_row).collect()
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredEvent, StoreError> {
    let event_id: String = row.try_get("event_id")?;
    let ciphertext: Option<String> = row.try_get("event_ciphertext")?;
    let plaintext: Option<String> = row.try_get("event_plaintext")?;
    let key_id: Option<String> = row.try_get("key_id")?;
    let origin_port: Option<i64> = row.try_get("origin_port")?;

    Ok(StoredEvent {
        event_id: EventId::from_hex(&event_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        event_type: row.try_get("event_type")?,
        plaintext: plaintext
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ciphertext: ciphertext
            .map(|c| hex::decode(&c))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        key_id: key_id
            .map(|k| KeyId::from_hex(&k))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        received_at: row.try_get("received_at")?,
        origin_ip: row.try_get("origin_ip")?,
        origin_port: origin_port.map(|p| p as u16),
        stored_at: row.try_get("stored_at")?,
        purged: row.try_get::<i64, _>("purged")? != 0,
        purged_at: row.try_get("purged_at")?,
        ttl_expire_at: row.try_get("ttl_expire_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn setup() -> sqlx::SqlitePool {
        let pool = db::open_in_memory().await.unwrap();
        db::run_migrations(&pool, []).await.unwrap();
        pool
    }

    fn sample<'a>(id: u8, plaintext: &'a JsonValue) -> NewEvent<'a> {
        NewEvent {
            event_id: EventId::from_bytes([id; 16]),
            event_type: "message",
            plaintext: Some(plaintext),
            ciphertext: Some(b"ct".as_slice()),
            key_id: None,
            received_at: Some(1_000),
            origin_ip: Some("10.0.0.1"),
            origin_port: Some(7000),
            stored_at: 2_000,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let plaintext = json!({"type": "message", "content": "hi"});

        assert!(put(&mut conn, &sample(1, &plaintext)).await.unwrap());

        let stored = get(&mut conn, EventId::from_bytes([1; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.event_type, "message");
        assert_eq!(stored.plaintext, Some(plaintext));
        assert_eq!(stored.ciphertext, Some(b"ct".to_vec()));
        assert!(!stored.purged);
    }

    #[tokio::test]
    async fn re_store_is_a_no_op() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let first = json!({"content": "original"});
        let second = json!({"content": "imposter"});

        assert!(put(&mut conn, &sample(1, &first)).await.unwrap());
        assert!(!put(&mut conn, &sample(1, &second)).await.unwrap());

        let stored = get(&mut conn, EventId::from_bytes([1; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.plaintext, Some(first));
    }

    #[tokio::test]
    async fn purge_clears_bodies_but_keeps_id() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let plaintext = json!({"content": "hi"});
        let id = EventId::from_bytes([1; 16]);

        put(&mut conn, &sample(1, &plaintext)).await.unwrap();
        purge(&mut conn, id, "validator rejection", 5_000, 60_000)
            .await
            .unwrap();

        assert!(exists(&mut conn, id).await.unwrap());
        let stored = get(&mut conn, id).await.unwrap().unwrap();
        assert!(stored.purged);
        assert_eq!(stored.plaintext, None);
        assert_eq!(stored.ciphertext, None);
        assert_eq!(stored.ttl_expire_at, Some(65_000));

        // Purged events never satisfy a dependency.
        assert!(get_validated(&mut conn, &id.to_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_tombstones_are_deleted() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let plaintext = json!({});
        let id = EventId::from_bytes([1; 16]);

        put(&mut conn, &sample(1, &plaintext)).await.unwrap();
        purge(&mut conn, id, "ttl test", 1_000, 10).await.unwrap();

        assert_eq!(delete_expired_tombstones(&mut conn, 500).await.unwrap(), 0);
        assert_eq!(delete_expired_tombstones(&mut conn, 2_000).await.unwrap(), 1);
        assert!(!exists(&mut conn, id).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_type_skips_purged() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let plaintext = json!({});

        put(&mut conn, &sample(1, &plaintext)).await.unwrap();
        put(&mut conn, &sample(2, &plaintext)).await.unwrap();
        purge(&mut conn, EventId::from_bytes([2; 16]), "test", 0, 0)
            .await
            .unwrap();

        let listed = list_by_type(&mut conn, "message").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_id, EventId::from_bytes([1; 16]));
    }
}
