//! Persisted job state and run counters.

use serde_json::Value as JsonValue;
use sqlx::{Row, SqliteConnection};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRunRow {
    pub job_name: String,
    pub runs: i64,
    pub failures: i64,
    pub last_run_ms: Option<i64>,
    pub last_ok_ms: Option<i64>,
    pub last_error: Option<String>,
}

pub async fn load_state(
    conn: &mut SqliteConnection,
    job_name: &str,
) -> Result<Option<JsonValue>, StoreError> {
    let row = sqlx::query("SELECT state_json FROM job_states WHERE job_name = ?1")
        .bind(job_name)
        .fetch_optional(conn)
        .await?;

    row.map(|row| {
        let state: String = row.try_get("state_json")?;
        serde_json::from_str(&state).map_err(|e| StoreError::Corrupt(e.to_string()))
    })
    .transpose()
}

pub async fn save_state(
    conn: &mut SqliteConnection,
    job_name: &str,
    state: &JsonValue,
    updated_ms: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_states (job_name, state_json, updated_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (job_name) DO UPDATE SET
            state_json = excluded.state_json,
            updated_ms = excluded.updated_ms
        "#,
    )
    .bind(job_name)
    .bind(serde_json::to_string(state)?)
    .bind(updated_ms)
    .execute(conn)
    .await?;
    Ok(())
}

/// Bump run counters; failures also record the error text.
pub async fn record_run(
    conn: &mut SqliteConnection,
    job_name: &str,
    now_ms: i64,
    ok: bool,
    error: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_name, runs, failures, last_run_ms, last_ok_ms, last_error)
        VALUES (?1, 1, ?2, ?3, ?4, ?5)
        ON CONFLICT (job_name) DO UPDATE SET
            runs = job_runs.runs + 1,
            failures = job_runs.failures + ?2,
            last_run_ms = ?3,
            last_ok_ms = COALESCE(?4, job_runs.last_ok_ms),
            last_error = COALESCE(?5, job_runs.last_error)
        "#,
    )
    .bind(job_name)
    .bind(if ok { 0i64 } else { 1i64 })
    .bind(now_ms)
    .bind(if ok { Some(now_ms) } else { None })
    .bind(error)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_runs(
    conn: &mut SqliteConnection,
    job_name: &str,
) -> Result<Option<JobRunRow>, StoreError> {
    let row = sqlx::query(
        "SELECT job_name, runs, failures, last_run_ms, last_ok_ms, last_error FROM job_runs WHERE job_name = ?1",
    )
    .bind(job_name)
    .fetch_optional(conn)
    .await?;

    row.map(|row| {
        Ok(JobRunRow {
            job_name: row.try_get("job_name")?,
            runs: row.try_get("runs")?,
            failures: row.try_get("failures")?,
            last_run_ms: row.try_get("last_run_ms")?,
            last_ok_ms: row.try_get("last_ok_ms")?,
            last_error: row.try_get("last_error")?,
        })
    })
    .transpose()
}
