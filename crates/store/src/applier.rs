//! The delta applier: the only writer of projected tables.
//!
//! Turns declarative [`Delta`]s into parameterized SQL. Identifiers are
//! validated against a strict charset before interpolation; every value is
//! bound. Deltas apply in the order the projector returned them, inside the
//! caller's transaction.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteArguments;
use sqlx::query::Query;
use sqlx::{Sqlite, SqliteConnection};

use coterie_pipeline::{Delta, OnConflict};

use crate::error::StoreError;

/// Apply deltas in order.
pub async fn apply(conn: &mut SqliteConnection, deltas: &[Delta]) -> Result<(), StoreError> {
    for delta in deltas {
        apply_one(conn, delta).await?;
    }
    Ok(())
}

/// Apply a single delta.
pub async fn apply_one(conn: &mut SqliteConnection, delta: &Delta) -> Result<(), StoreError> {
    match delta {
        Delta::Insert {
            table,
            data,
            on_conflict,
        } => {
            if data.is_empty() {
                return Err(StoreError::InvalidDelta("insert with no columns".into()));
            }
            check_ident(table)?;
            for column in data.keys() {
                check_ident(column)?;
            }

            let columns: Vec<&str> = data.keys().map(String::as_str).collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let verb = match on_conflict {
                OnConflict::Error => "INSERT",
                OnConflict::Ignore => "INSERT OR IGNORE",
                OnConflict::Update => "INSERT OR REPLACE",
            };
            let sql = format!(
                "{verb} INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for value in data.values() {
                query = bind_json(query, value);
            }
            query.execute(conn).await?;
        }

        Delta::Update {
            table,
            data,
            filter,
        } => {
            if data.is_empty() {
                return Err(StoreError::InvalidDelta("update with no columns".into()));
            }
            if filter.is_empty() {
                return Err(StoreError::InvalidDelta("update without where clause".into()));
            }
            check_ident(table)?;
            for column in data.keys().chain(filter.keys()) {
                check_ident(column)?;
            }

            let mut index = 0usize;
            let assignments: Vec<String> = data
                .keys()
                .map(|c| {
                    index += 1;
                    format!("{c} = ?{index}")
                })
                .collect();
            let conditions: Vec<String> = filter
                .keys()
                .map(|c| {
                    index += 1;
                    format!("{c} = ?{index}")
                })
                .collect();
            let sql = format!(
                "UPDATE {table} SET {} WHERE {}",
                assignments.join(", "),
                conditions.join(" AND ")
            );

            let mut query = sqlx::query(&sql);
            for value in data.values().chain(filter.values()) {
                query = bind_json(query, value);
            }
            query.execute(conn).await?;
        }

        Delta::Delete { table, filter } => {
            if filter.is_empty() {
                return Err(StoreError::InvalidDelta("delete without where clause".into()));
            }
            check_ident(table)?;
            for column in filter.keys() {
                check_ident(column)?;
            }

            let conditions: Vec<String> = filter
                .keys()
                .enumerate()
                .map(|(i, c)| format!("{c} = ?{}", i + 1))
                .collect();
            let sql = format!("DELETE FROM {table} WHERE {}", conditions.join(" AND "));

            let mut query = sqlx::query(&sql);
            for value in filter.values() {
                query = bind_json(query, value);
            }
            query.execute(conn).await?;
        }
    }
    Ok(())
}

/// Lowercase snake-case identifiers only; everything else is rejected before
/// it can reach the SQL text.
fn check_ident(ident: &str) -> Result<(), StoreError> {
    let mut chars = ident.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidDelta(format!("bad identifier: {ident:?}")))
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(Option::<String>::None),
        JsonValue::Bool(b) => query.bind(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => query.bind(s.as_str()),
        // Arrays and objects land as JSON text columns.
        other => query.bind(other.to_string()),
    }
}
