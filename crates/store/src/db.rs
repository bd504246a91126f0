//! Database open + migrations.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;

/// Schema for the pipeline's own tables. Projected tables are declared by
/// projectors and created by [`run_migrations`] alongside these.
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id         TEXT PRIMARY KEY,
    event_type       TEXT NOT NULL,
    event_ciphertext TEXT,
    event_plaintext  TEXT,
    key_id           TEXT,
    received_at      INTEGER,
    origin_ip        TEXT,
    origin_port      INTEGER,
    stored_at        INTEGER NOT NULL,
    purged           INTEGER NOT NULL DEFAULT 0,
    purged_at        INTEGER,
    purge_reason     TEXT,
    ttl_expire_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

CREATE TABLE IF NOT EXISTS signing_keys (
    peer_id     TEXT PRIMARY KEY,
    network_id  TEXT,
    private_key TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transit_keys (
    key_id     TEXT PRIMARY KEY,
    network_id TEXT,
    secret     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS event_keys (
    key_id     TEXT PRIMARY KEY,
    network_id TEXT,
    group_id   TEXT,
    secret     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS known_addresses (
    peer_hint  TEXT PRIMARY KEY,
    network_id TEXT,
    ip         TEXT NOT NULL,
    port       INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocked_events (
    event_id      TEXT PRIMARY KEY,
    envelope_json TEXT NOT NULL,
    missing_deps  TEXT NOT NULL,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    blocked_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocked_event_deps (
    dep_id   TEXT NOT NULL,
    event_id TEXT NOT NULL,
    PRIMARY KEY (dep_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_blocked_event_deps_dep ON blocked_event_deps(dep_id);

CREATE TABLE IF NOT EXISTS outbox (
    outbox_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    transit_key_id     TEXT NOT NULL,
    transit_ciphertext TEXT NOT NULL,
    dest_ip            TEXT NOT NULL,
    dest_port          INTEGER NOT NULL,
    due_ms             INTEGER,
    queued_at          INTEGER NOT NULL,
    sent_at            INTEGER
);

CREATE TABLE IF NOT EXISTS job_states (
    job_name   TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS job_runs (
    job_name    TEXT PRIMARY KEY,
    runs        INTEGER NOT NULL DEFAULT 0,
    failures    INTEGER NOT NULL DEFAULT 0,
    last_run_ms INTEGER,
    last_ok_ms  INTEGER,
    last_error  TEXT
);
"#;

/// Open (or create) the database at `path`.
pub async fn open(path: impl AsRef<Path>) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    info!(path = %path.as_ref().display(), "database opened");
    Ok(pool)
}

/// Open an in-memory database (tests, throwaway nodes).
pub async fn open_in_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(sqlx::Error::from)?;

    // A single connection keeps the in-memory database alive and enforces
    // the single-writer discipline the pipeline assumes.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create the base schema plus every projector-declared schema.
pub async fn run_migrations<'a>(
    pool: &SqlitePool,
    projected_schemas: impl IntoIterator<Item = &'a str>,
) -> Result<(), StoreError> {
    sqlx::raw_sql(BASE_SCHEMA).execute(pool).await?;
    for schema in projected_schemas {
        sqlx::raw_sql(schema).execute(pool).await?;
    }
    Ok(())
}
