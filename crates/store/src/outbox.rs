//! Outbox: durable queue of wire-ready datagrams.
//!
//! The send handler's terminal write. The network layer drains due entries
//! and marks them sent; nothing in here ever sees plaintext or key material
//! because rows are built from [`OutgoingTransitEnvelope`] only.

use sqlx::{Row, SqliteConnection};

use coterie_core::KeyId;
use coterie_pipeline::OutgoingTransitEnvelope;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub outbox_id: i64,
    pub envelope: OutgoingTransitEnvelope,
    pub queued_at: i64,
    pub sent_at: Option<i64>,
}

pub async fn push(
    conn: &mut SqliteConnection,
    envelope: &OutgoingTransitEnvelope,
    queued_at: i64,
) -> Result<i64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO outbox (transit_key_id, transit_ciphertext, dest_ip, dest_port, due_ms, queued_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(envelope.transit_key_id.to_hex())
    .bind(hex::encode(&envelope.transit_ciphertext))
    .bind(&envelope.dest_ip)
    .bind(i64::from(envelope.dest_port))
    .bind(envelope.due_ms)
    .bind(queued_at)
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Unsent entries whose due time has passed (or that have none), FIFO.
pub async fn due(conn: &mut SqliteConnection, now_ms: i64) -> Result<Vec<OutboxRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT outbox_id, transit_key_id, transit_ciphertext, dest_ip, dest_port, due_ms, queued_at, sent_at
        FROM outbox
        WHERE sent_at IS NULL AND (due_ms IS NULL OR due_ms <= ?1)
        ORDER BY outbox_id ASC
        "#,
    )
    .bind(now_ms)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(decode).collect()
}

pub async fn mark_sent(
    conn: &mut SqliteConnection,
    outbox_id: i64,
    sent_at: i64,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE outbox SET sent_at = ?2 WHERE outbox_id = ?1")
        .bind(outbox_id)
        .bind(sent_at)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn pending_count(conn: &mut SqliteConnection) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM outbox WHERE sent_at IS NULL")
        .fetch_one(conn)
        .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n as u64)
}

fn decode(row: sqlx::sqlite::SqliteRow) -> Result<OutboxRow, StoreError> {
    let key_id: String = row.try_get("transit_key_id")?;
    let ciphertext: String = row.try_get("transit_ciphertext")?;
    let port: i64 = row.try_get("dest_port")?;

    Ok(OutboxRow {
        outbox_id: row.try_get("outbox_id")?,
        envelope: OutgoingTransitEnvelope {
            transit_key_id: KeyId::from_hex(&key_id)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            transit_ciphertext: hex::decode(&ciphertext)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            dest_ip: row.try_get("dest_ip")?,
            dest_port: port as u16,
            due_ms: row.try_get("due_ms")?,
        },
        queued_at: row.try_get("queued_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn wire(due_ms: Option<i64>) -> OutgoingTransitEnvelope {
        OutgoingTransitEnvelope {
            transit_ciphertext: vec![1, 2, 3],
            transit_key_id: KeyId::from_bytes([9; 32]),
            dest_ip: "10.0.0.9".into(),
            dest_port: 7000,
            due_ms,
        }
    }

    #[tokio::test]
    async fn push_due_mark_sent_cycle() {
        let pool = db::open_in_memory().await.unwrap();
        db::run_migrations(&pool, []).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let id_now = push(&mut conn, &wire(None), 100).await.unwrap();
        let _id_later = push(&mut conn, &wire(Some(5_000)), 100).await.unwrap();

        let ready = due(&mut conn, 1_000).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].outbox_id, id_now);
        assert_eq!(ready[0].envelope, wire(None));

        mark_sent(&mut conn, id_now, 1_500).await.unwrap();
        assert!(due(&mut conn, 1_000).await.unwrap().is_empty());

        // The delayed entry becomes due later.
        let ready = due(&mut conn, 6_000).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(pending_count(&mut conn).await.unwrap(), 1);
    }
}
