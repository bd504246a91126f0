//! Time-triggered jobs.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use coterie_pipeline::Envelope;
use coterie_store::ReadOnlyDb;

use crate::ops::{Job, JobOutcome};

/// Default GC cadence: hourly.
pub const TOMBSTONE_GC_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Emits a control envelope instructing the event-store owner to delete
/// tombstones whose TTL expired. State: `{"last_run_ms": n}`.
pub struct TombstoneGc {
    pub interval_ms: i64,
}

impl Default for TombstoneGc {
    fn default() -> Self {
        Self {
            interval_ms: TOMBSTONE_GC_INTERVAL_MS,
        }
    }
}

#[async_trait]
impl Job for TombstoneGc {
    fn name(&self) -> &'static str {
        "tombstone_gc"
    }

    async fn run(&self, state: JsonValue, _db: &ReadOnlyDb, now_ms: i64) -> JobOutcome {
        let last_run_ms = state.get("last_run_ms").and_then(JsonValue::as_i64).unwrap_or(0);
        if now_ms - last_run_ms < self.interval_ms {
            return JobOutcome::ok(state, vec![]);
        }

        let sweep = Envelope {
            gc_tombstones_before: Some(now_ms),
            ..Envelope::default()
        };
        JobOutcome::ok(json!({"last_run_ms": now_ms}), vec![sweep])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> ReadOnlyDb {
        let pool = coterie_store::open_in_memory().await.unwrap();
        coterie_store::run_migrations(&pool, []).await.unwrap();
        ReadOnlyDb::new(pool)
    }

    #[tokio::test]
    async fn emits_sweep_when_interval_elapsed() {
        let job = TombstoneGc { interval_ms: 100 };
        let db = db().await;

        let first = job.run(json!({}), &db, 1_000).await;
        assert!(first.ok);
        assert_eq!(first.envelopes.len(), 1);
        assert_eq!(first.envelopes[0].gc_tombstones_before, Some(1_000));
        assert_eq!(first.state, json!({"last_run_ms": 1_000}));
    }

    #[tokio::test]
    async fn is_quiet_inside_the_interval() {
        let job = TombstoneGc { interval_ms: 100 };
        let db = db().await;

        let out = job.run(json!({"last_run_ms": 950}), &db, 1_000).await;
        assert!(out.ok);
        assert!(out.envelopes.is_empty());
        assert_eq!(out.state, json!({"last_run_ms": 950}));
    }
}
