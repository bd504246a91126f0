//! Read-only query facade.
//!
//! Queries, flows, jobs, and reflectors see the database only through this
//! wrapper. It admits `SELECT`/`WITH` statements and rejects anything that
//! could mutate, so the delta applier and handler-private modules remain the
//! only writers.

use serde_json::{Map, Value as JsonValue};
use sqlx::sqlite::SqliteArguments;
use sqlx::query::Query;
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};

use crate::error::StoreError;

const FORBIDDEN: &[&str] = &[
    "insert", "update", "delete", "create", "drop", "alter", "replace", "pragma", "attach",
    "vacuum", "reindex",
];

/// Read-only connection wrapper around the node's pool.
#[derive(Debug, Clone)]
pub struct ReadOnlyDb {
    pool: SqlitePool,
}

impl ReadOnlyDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run a SELECT and return rows as JSON objects keyed by column name.
    pub async fn query(
        &self,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<Vec<Map<String, JsonValue>>, StoreError> {
        guard(sql)?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }

        let mut conn = self.pool.acquire().await?;
        let rows = query.fetch_all(&mut *conn).await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Run a SELECT expected to yield at most one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<Option<Map<String, JsonValue>>, StoreError> {
        let mut rows = self.query(sql, params).await?;
        if rows.len() > 1 {
            return Err(StoreError::Rejected("query_one returned multiple rows".into()));
        }
        Ok(rows.pop())
    }
}

/// Reject anything that is not a single read statement.
fn guard(sql: &str) -> Result<(), StoreError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.contains(';') {
        return Err(StoreError::Rejected("multiple statements".into()));
    }

    let lowered = trimmed.to_ascii_lowercase();
    let mut tokens = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty());

    match tokens.next() {
        Some("select") | Some("with") => {}
        _ => return Err(StoreError::Rejected("only SELECT statements are allowed".into())),
    }

    for token in tokens {
        if FORBIDDEN.contains(&token) {
            return Err(StoreError::Rejected(format!("forbidden keyword: {token}")));
        }
    }
    Ok(())
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
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<Map<String, JsonValue>, StoreError> {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            JsonValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => JsonValue::from(row.try_get::<i64, _>(i)?),
                "REAL" => JsonValue::from(row.try_get::<f64, _>(i)?),
                "BLOB" => JsonValue::from(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => JsonValue::from(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
