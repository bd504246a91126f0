//! Declarative projection deltas.
//!
//! Projectors return these instead of running SQL, which keeps them pure and
//! lets the same projector be tested against an in-memory applier. WHERE
//! clauses are equality-only by construction. The single-writer applier in
//! `coterie-store` turns deltas into parameterized SQL.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Conflict policy for inserts, keyed on the target table's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Surface the constraint violation.
    #[default]
    Error,
    /// Keep the existing row.
    Ignore,
    /// Overwrite the conflicting columns (upsert).
    Update,
}

/// One state mutation. Applied in returned order, inside the projecting
/// handler's transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    Insert {
        table: String,
        data: Map<String, JsonValue>,
        #[serde(default, skip_serializing_if = "is_default_conflict")]
        on_conflict: OnConflict,
    },
    Update {
        table: String,
        data: Map<String, JsonValue>,
        #[serde(rename = "where")]
        filter: Map<String, JsonValue>,
    },
    Delete {
        table: String,
        #[serde(rename = "where")]
        filter: Map<String, JsonValue>,
    },
}

fn is_default_conflict(v: &OnConflict) -> bool {
    *v == OnConflict::Error
}

impl Delta {
    pub fn table(&self) -> &str {
        match self {
            Delta::Insert { table, .. } | Delta::Update { table, .. } | Delta::Delete { table, .. } => {
                table
            }
        }
    }

    /// Insert with upsert semantics; the common projector case.
    pub fn upsert(table: impl Into<String>, data: Map<String, JsonValue>) -> Self {
        Delta::Insert {
            table: table.into(),
            data,
            on_conflict: OnConflict::Update,
        }
    }

    /// Insert that keeps an existing row on conflict.
    pub fn insert_or_ignore(table: impl Into<String>, data: Map<String, JsonValue>) -> Self {
        Delta::Insert {
            table: table.into(),
            data,
            on_conflict: OnConflict::Ignore,
        }
    }
}

/// Errors from the in-memory applier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryApplyError {
    #[error("conflict on {table}.{column}")]
    Conflict { table: String, column: String },
}

/// Dictionary-backed delta applier.
///
/// Projectors are pure, so the same delta list that drives the SQL applier
/// can be replayed against plain maps in unit tests. Conflict detection
/// needs to know each table's key column; tables without a declared key are
/// append-only.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryApplier {
    keys: std::collections::BTreeMap<String, String>,
    tables: std::collections::BTreeMap<String, Vec<Map<String, JsonValue>>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table's key column for conflict handling.
    pub fn with_key(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.keys.insert(table.into(), column.into());
        self
    }

    pub fn rows(&self, table: &str) -> &[Map<String, JsonValue>] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn apply(&mut self, deltas: &[Delta]) -> Result<(), MemoryApplyError> {
        for delta in deltas {
            self.apply_one(delta)?;
        }
        Ok(())
    }

    pub fn apply_one(&mut self, delta: &Delta) -> Result<(), MemoryApplyError> {
        match delta {
            Delta::Insert {
                table,
                data,
                on_conflict,
            } => {
                let key = self.keys.get(table).cloned();
                let rows = self.tables.entry(table.clone()).or_default();
                let conflicting = key.as_deref().and_then(|column| {
                    let new_key = data.get(column)?;
                    rows.iter().position(|row| row.get(column) == Some(new_key))
                });
                match (conflicting, on_conflict) {
                    (None, _) => rows.push(data.clone()),
                    (Some(_), OnConflict::Ignore) => {}
                    (Some(i), OnConflict::Update) => rows[i] = data.clone(),
                    (Some(_), OnConflict::Error) => {
                        return Err(MemoryApplyError::Conflict {
                            table: table.clone(),
                            column: key.unwrap_or_default(),
                        });
                    }
                }
            }
            Delta::Update {
                table,
                data,
                filter,
            } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    for row in rows.iter_mut().filter(|row| matches_filter(row, filter)) {
                        for (column, value) in data {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                }
            }
            Delta::Delete { table, filter } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.retain(|row| !matches_filter(row, filter));
                }
            }
        }
        Ok(())
    }
}

fn matches_filter(row: &Map<String, JsonValue>, filter: &Map<String, JsonValue>) -> bool {
    filter.iter().all(|(column, value)| row.get(column) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn serde_shape_matches_the_declarative_form() {
        let delta = Delta::upsert("messages", row(&[("message_id", json!("ab")), ("content", json!("hi"))]));
        let v = serde_json::to_value(&delta).unwrap();

        assert_eq!(v["op"], "insert");
        assert_eq!(v["table"], "messages");
        assert_eq!(v["on_conflict"], "update");
        assert_eq!(v["data"]["content"], "hi");
    }

    #[test]
    fn where_serializes_under_its_sql_name() {
        let delta = Delta::Delete {
            table: "receipts".into(),
            filter: row(&[("message_id", json!("ab"))]),
        };
        let v = serde_json::to_value(&delta).unwrap();
        assert!(v.get("where").is_some());
    }

    #[test]
    fn memory_applier_mirrors_upsert_semantics() {
        let mut applier = MemoryApplier::new().with_key("widgets", "widget_id");

        applier
            .apply(&[
                Delta::upsert("widgets", row(&[("widget_id", json!("w1")), ("label", json!("a"))])),
                Delta::upsert("widgets", row(&[("widget_id", json!("w1")), ("label", json!("b"))])),
                Delta::insert_or_ignore(
                    "widgets",
                    row(&[("widget_id", json!("w1")), ("label", json!("c"))]),
                ),
            ])
            .unwrap();

        assert_eq!(applier.rows("widgets").len(), 1);
        assert_eq!(applier.rows("widgets")[0]["label"], json!("b"));
    }

    #[test]
    fn memory_applier_surfaces_conflicts_and_applies_updates() {
        let mut applier = MemoryApplier::new().with_key("widgets", "widget_id");
        let data = row(&[("widget_id", json!("w1")), ("label", json!("a"))]);

        applier
            .apply_one(&Delta::Insert {
                table: "widgets".into(),
                data: data.clone(),
                on_conflict: OnConflict::Error,
            })
            .unwrap();
        let err = applier.apply_one(&Delta::Insert {
            table: "widgets".into(),
            data,
            on_conflict: OnConflict::Error,
        });
        assert!(matches!(err, Err(MemoryApplyError::Conflict { .. })));

        applier
            .apply_one(&Delta::Update {
                table: "widgets".into(),
                data: row(&[("label", json!("z"))]),
                filter: row(&[("widget_id", json!("w1"))]),
            })
            .unwrap();
        assert_eq!(applier.rows("widgets")[0]["label"], json!("z"));

        applier
            .apply_one(&Delta::Delete {
                table: "widgets".into(),
                filter: row(&[("widget_id", json!("w1"))]),
            })
            .unwrap();
        assert!(applier.rows("widgets").is_empty());
    }

    #[test]
    fn default_conflict_policy_is_omitted() {
        let delta = Delta::Insert {
            table: "t".into(),
            data: row(&[("a", json!(1))]),
            on_conflict: OnConflict::Error,
        };
        let v = serde_json::to_value(&delta).unwrap();
        assert!(v.get("on_conflict").is_none());
    }
}
