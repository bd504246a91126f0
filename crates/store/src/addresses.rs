//! Known peer addresses.
//!
//! Upserted by the receive handler from datagram origins and by the keys
//! handler from invite bootstrap data; read by `check_outgoing` for fan-out
//! and by the resolver for `address:` deps.

use sqlx::{Row, SqliteConnection};

use coterie_core::EventId;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    /// Peer id when known, otherwise an `ip:port` placeholder hint.
    pub peer_hint: String,
    pub network_id: Option<EventId>,
    pub ip: String,
    pub port: u16,
    pub updated_at: i64,
}

pub async fn upsert(
    conn: &mut SqliteConnection,
    peer_hint: &str,
    network_id: Option<EventId>,
    ip: &str,
    port: u16,
    updated_at: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO known_addresses (peer_hint, network_id, ip, port, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (peer_hint) DO UPDATE SET
            network_id = COALESCE(excluded.network_id, known_addresses.network_id),
            ip = excluded.ip,
            port = excluded.port,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(peer_hint)
    .bind(network_id.map(|n| n.to_hex()))
    .bind(ip)
    .bind(i64::from(port))
    .bind(updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    peer_hint: &str,
) -> Result<Option<AddressRow>, StoreError> {
    let row = sqlx::query(
        "SELECT peer_hint, network_id, ip, port, updated_at FROM known_addresses WHERE peer_hint = ?1",
    )
    .bind(peer_hint)
    .fetch_optional(conn)
    .await?;

    row.map(decode).transpose()
}

/// Every known address on a network, oldest hint first.
pub async fn list_for_network(
    conn: &mut SqliteConnection,
    network_id: EventId,
) -> Result<Vec<AddressRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT peer_hint, network_id, ip, port, updated_at
        FROM known_addresses
        WHERE network_id = ?1
        ORDER BY updated_at ASC, peer_hint ASC
        "#,
    )
    .bind(network_id.to_hex())
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(decode).collect()
}

fn decode(row: sqlx::sqlite::SqliteRow) -> Result<AddressRow, StoreError> {
    let network_id: Option<String> = row.try_get("network_id")?;
    let port: i64 = row.try_get("port")?;
    Ok(AddressRow {
        peer_hint: row.try_get("peer_hint")?,
        network_id: network_id
            .map(|n| EventId::from_hex(&n))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ip: row.try_get("ip")?,
        port: port as u16,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn upsert_replaces_address_for_hint() {
        let pool = db::open_in_memory().await.unwrap();
        db::run_migrations(&pool, []).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let network = EventId::from_bytes([1; 16]);

        upsert(&mut conn, "aa", Some(network), "10.0.0.1", 7000, 1).await.unwrap();
        upsert(&mut conn, "aa", None, "10.0.0.2", 7001, 2).await.unwrap();

        let row = get(&mut conn, "aa").await.unwrap().unwrap();
        assert_eq!(row.ip, "10.0.0.2");
        assert_eq!(row.port, 7001);
        // A later upsert without a network keeps the earlier attribution.
        assert_eq!(row.network_id, Some(network));
    }

    #[tokio::test]
    async fn list_for_network_filters() {
        let pool = db::open_in_memory().await.unwrap();
        db::run_migrations(&pool, []).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let n1 = EventId::from_bytes([1; 16]);
        let n2 = EventId::from_bytes([2; 16]);

        upsert(&mut conn, "aa", Some(n1), "10.0.0.1", 7000, 1).await.unwrap();
        upsert(&mut conn, "bb", Some(n2), "10.0.0.2", 7000, 2).await.unwrap();

        let listed = list_for_network(&mut conn, n1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].peer_hint, "aa");
    }
}
