//! Local secret tables: signing seeds and symmetric keys.
//!
//! Append-only; written by the `keys` handler, consulted by the dependency
//! resolver. Secrets are stored hex-encoded in a local, single-user database
//! and never leave the node (the outbound envelope type has no field for
//! them).

use sqlx::{Row, SqliteConnection};

use coterie_core::{EventId, KeyId, Secret};

use crate::error::StoreError;

/// A stored signing seed, addressable by peer id or identity event id.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningKeyRow {
    pub peer_id: String,
    pub network_id: Option<EventId>,
    pub private_key: Secret,
    pub created_at: i64,
}

/// A stored symmetric key (transit or event layer).
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricKeyRow {
    pub key_id: KeyId,
    pub network_id: Option<EventId>,
    pub group_id: Option<EventId>,
    pub secret: Secret,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

pub async fn insert_signing_key(
    conn: &mut SqliteConnection,
    peer_id: &str,
    network_id: Option<EventId>,
    private_key: &Secret,
    created_at: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO signing_keys (peer_id, network_id, private_key, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (peer_id) DO NOTHING
        "#,
    )
    .bind(peer_id)
    .bind(network_id.map(|n| n.to_hex()))
    .bind(private_key.to_hex())
    .bind(created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_signing_key(
    conn: &mut SqliteConnection,
    peer_id: &str,
) -> Result<Option<SigningKeyRow>, StoreError> {
    let row = sqlx::query(
        "SELECT peer_id, network_id, private_key, created_at FROM signing_keys WHERE peer_id = ?1",
    )
    .bind(peer_id)
    .fetch_optional(conn)
    .await?;

    row.map(|row| {
        let network_id: Option<String> = row.try_get("network_id")?;
        let private_key: String = row.try_get("private_key")?;
        Ok(SigningKeyRow {
            peer_id: row.try_get("peer_id")?,
            network_id: network_id
                .map(|n| EventId::from_hex(&n))
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            private_key: Secret::from_hex(&private_key)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            created_at: row.try_get("created_at")?,
        })
    })
    .transpose()
}

pub async fn insert_transit_key(
    conn: &mut SqliteConnection,
    key_id: KeyId,
    network_id: Option<EventId>,
    secret: &Secret,
    created_at: i64,
    expires_at: Option<i64>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO transit_keys (key_id, network_id, secret, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (key_id) DO NOTHING
        "#,
    )
    .bind(key_id.to_hex())
    .bind(network_id.map(|n| n.to_hex()))
    .bind(secret.to_hex())
    .bind(created_at)
    .bind(expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_transit_key(
    conn: &mut SqliteConnection,
    key_id: KeyId,
) -> Result<Option<SymmetricKeyRow>, StoreError> {
    fetch_symmetric(conn, "transit_keys", &key_id.to_hex()).await
}

/// The transit key for a network, newest first (outbound key selection).
pub async fn transit_key_for_network(
    conn: &mut SqliteConnection,
    network_id: EventId,
) -> Result<Option<SymmetricKeyRow>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT key_id, network_id, NULL AS group_id, secret, created_at, expires_at
        FROM transit_keys
        WHERE network_id = ?1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(network_id.to_hex())
    .fetch_optional(conn)
    .await?;

    row.map(decode_symmetric).transpose()
}

pub async fn insert_event_key(
    conn: &mut SqliteConnection,
    key_id: KeyId,
    network_id: Option<EventId>,
    group_id: Option<EventId>,
    secret: &Secret,
    created_at: i64,
    expires_at: Option<i64>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO event_keys (key_id, network_id, group_id, secret, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (key_id) DO NOTHING
        "#,
    )
    .bind(key_id.to_hex())
    .bind(network_id.map(|n| n.to_hex()))
    .bind(group_id.map(|g| g.to_hex()))
    .bind(secret.to_hex())
    .bind(created_at)
    .bind(expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_event_key(
    conn: &mut SqliteConnection,
    key_id: KeyId,
) -> Result<Option<SymmetricKeyRow>, StoreError> {
    fetch_symmetric(conn, "event_keys", &key_id.to_hex()).await
}

async fn fetch_symmetric(
    conn: &mut SqliteConnection,
    table: &str,
    key_id_hex: &str,
) -> Result<Option<SymmetricKeyRow>, StoreError> {
    // Table name is one of two compile-time constants; ids are bound.
    let sql = if table == "transit_keys" {
        "SELECT key_id, network_id, NULL AS group_id, secret, created_at, expires_at \
         FROM transit_keys WHERE key_id = ?1"
    } else {
        "SELECT key_id, network_id, group_id, secret, created_at, expires_at \
         FROM event_keys WHERE key_id = ?1"
    };

    let row = sqlx::query(sql).bind(key_id_hex).fetch_optional(conn).await?;
    row.map(decode_symmetric).transpose()
}

fn decode_symmetric(row: sqlx::sqlite::SqliteRow) -> Result<SymmetricKeyRow, StoreError> {
    let key_id: String = row.try_get("key_id")?;
    let network_id: Option<String> = row.try_get("network_id")?;
    let group_id: Option<String> = row.try_get("group_id")?;
    let secret: String = row.try_get("secret")?;

    Ok(SymmetricKeyRow {
        key_id: KeyId::from_hex(&key_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        network_id: network_id
            .map(|n| EventId::from_hex(&n))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        group_id: group_id
            .map(|g| EventId::from_hex(&g))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        secret: Secret::from_hex(&secret).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}
