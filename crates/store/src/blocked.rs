//! Parked envelopes awaiting dependencies.
//!
//! `blocked_events` holds the serialized envelope keyed by its event id (or
//! a synthetic id before one is assigned); `blocked_event_deps` is the
//! secondary index from missing dep id to blocked envelope. Rewake order is
//! `blocked_at` ascending, ties broken by insertion (rowid).

use sqlx::{Row, SqliteConnection};

use coterie_core::DepRef;
use coterie_pipeline::Envelope;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockedRow {
    pub blocked_id: String,
    pub envelope: Envelope,
    pub missing: Vec<DepRef>,
    pub retry_count: u32,
    pub blocked_at: i64,
}

/// Park an envelope. Re-parking under the same id replaces the row and its
/// dep index entries (the missing set may have shrunk).
pub async fn park(
    conn: &mut SqliteConnection,
    blocked_id: &str,
    envelope: &Envelope,
    missing: &[DepRef],
    blocked_at: i64,
) -> Result<(), StoreError> {
    let envelope_json = serde_json::to_string(envelope)?;
    let missing_json = serde_json::to_string(missing)?;

    sqlx::query(
        r#"
        INSERT INTO blocked_events (event_id, envelope_json, missing_deps, retry_count, blocked_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (event_id) DO UPDATE SET
            envelope_json = excluded.envelope_json,
            missing_deps = excluded.missing_deps,
            retry_count = excluded.retry_count,
            blocked_at = blocked_events.blocked_at
        "#,
    )
    .bind(blocked_id)
    .bind(&envelope_json)
    .bind(&missing_json)
    .bind(i64::from(envelope.retry_count))
    .bind(blocked_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM blocked_event_deps WHERE event_id = ?1")
        .bind(blocked_id)
        .execute(&mut *conn)
        .await?;

    for dep in missing {
        sqlx::query(
            r#"
            INSERT INTO blocked_event_deps (dep_id, event_id)
            VALUES (?1, ?2)
            ON CONFLICT (dep_id, event_id) DO NOTHING
            "#,
        )
        .bind(&dep.id)
        .bind(blocked_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Pop every envelope parked on `dep_id`, in insertion order, deleting the
/// parked rows and their index entries.
pub async fn take_for_dep(
    conn: &mut SqliteConnection,
    dep_id: &str,
) -> Result<Vec<BlockedRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT be.event_id, be.envelope_json, be.missing_deps, be.retry_count, be.blocked_at
        FROM blocked_events be
        JOIN blocked_event_deps bed ON bed.event_id = be.event_id
        WHERE bed.dep_id = ?1
        ORDER BY be.blocked_at ASC, be.rowid ASC
        "#,
    )
    .bind(dep_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut parked = Vec::with_capacity(rows.len());
    for row in rows {
        parked.push(decode(row)?);
    }

    for entry in &parked {
        remove(conn, &entry.blocked_id).await?;
    }

    Ok(parked)
}

/// Delete one parked envelope and its index entries.
pub async fn remove(conn: &mut SqliteConnection, blocked_id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM blocked_events WHERE event_id = ?1")
        .bind(blocked_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM blocked_event_deps WHERE event_id = ?1")
        .bind(blocked_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    blocked_id: &str,
) -> Result<Option<BlockedRow>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT event_id, envelope_json, missing_deps, retry_count, blocked_at
        FROM blocked_events
        WHERE event_id = ?1
        "#,
    )
    .bind(blocked_id)
    .fetch_optional(conn)
    .await?;

    row.map(decode).transpose()
}

pub async fn count(conn: &mut SqliteConnection) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM blocked_events")
        .fetch_one(conn)
        .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n as u64)
}

fn decode(row: sqlx::sqlite::SqliteRow) -> Result<BlockedRow, StoreError> {
    let envelope_json: String = row.try_get("envelope_json")?;
    let missing_json: String = row.try_get("missing_deps")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(BlockedRow {
        blocked_id: row.try_get("event_id")?,
        envelope: serde_json::from_str(&envelope_json)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        missing: serde_json::from_str(&missing_json)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        retry_count: retry_count as u32,
        blocked_at: row.try_get("blocked_at")?,
    })
}
