//! SQLite durable log repository implementation.
//!
//! Implements `DurableLogRepository` from `taskloom-core`. The state header
//! lives in `durable_states`, the suspend log in `suspend_log`, one row per
//! suspension point. Conditions, outcomes and statuses are stored as JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskloom_core::repository::durable::DurableLogRepository;
use taskloom_types::durable::{DurableExecutionState, DurableStatus, SuspendLogEntry};
use taskloom_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;
use crate::suspend_log::{LogChange, plan_changes};

/// SQLite-backed implementation of `DurableLogRepository`.
pub struct SqliteDurableLogRepository {
    pool: DatabasePool,
}

impl SqliteDurableLogRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct StateRow {
    task_instance_id: String,
    sequence_cursor: i64,
    status: String,
}

impl StateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_instance_id: row.try_get("task_instance_id")?,
            sequence_cursor: row.try_get("sequence_cursor")?,
            status: row.try_get("status")?,
        })
    }

    fn into_state(self, suspend_log: Vec<SuspendLogEntry>) -> Result<DurableExecutionState, RepositoryError> {
        let status: DurableStatus = serde_json::from_str(&self.status)
            .map_err(|e| RepositoryError::Corrupt(format!("invalid durable status: {e}")))?;
        Ok(DurableExecutionState {
            task_instance_id: parse_uuid(&self.task_instance_id)?,
            sequence_cursor: self.sequence_cursor.max(0) as u64,
            status,
            suspend_log,
        })
    }
}

struct LogRow {
    task_instance_id: String,
    sequence: i64,
    condition: String,
    fingerprint: String,
    anchored_at: String,
    deadline: Option<String>,
    outcome: Option<String>,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_instance_id: row.try_get("task_instance_id")?,
            sequence: row.try_get("sequence")?,
            condition: row.try_get("condition")?,
            fingerprint: row.try_get("fingerprint")?,
            anchored_at: row.try_get("anchored_at")?,
            deadline: row.try_get("deadline")?,
            outcome: row.try_get("outcome")?,
        })
    }

    fn into_entry(self) -> Result<SuspendLogEntry, RepositoryError> {
        let condition = serde_json::from_str(&self.condition)
            .map_err(|e| RepositoryError::Corrupt(format!("invalid condition JSON: {e}")))?;
        let outcome = self
            .outcome
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Corrupt(format!("invalid outcome JSON: {e}")))
            })
            .transpose()?;

        Ok(SuspendLogEntry {
            sequence: self.sequence.max(0) as u64,
            condition,
            fingerprint: self.fingerprint,
            anchored_at: parse_datetime(&self.anchored_at)?,
            deadline: self.deadline.as_deref().map(parse_datetime).transpose()?,
            outcome,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Corrupt(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

/// Entries for one instance, ordered by sequence.
async fn load_log<'e, E>(executor: E, task_instance_id: &Uuid) -> Result<Vec<SuspendLogEntry>, RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM suspend_log WHERE task_instance_id = ? ORDER BY sequence ASC")
        .bind(task_instance_id.to_string())
        .fetch_all(executor)
        .await
        .map_err(query_error)?;

    rows.iter()
        .map(|row| LogRow::from_row(row).map_err(query_error)?.into_entry())
        .collect()
}

// ---------------------------------------------------------------------------
// Repository implementation
// ---------------------------------------------------------------------------

impl DurableLogRepository for SqliteDurableLogRepository {
    async fn load_state(
        &self,
        task_instance_id: &Uuid,
    ) -> Result<Option<DurableExecutionState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT task_instance_id, sequence_cursor, status FROM durable_states WHERE task_instance_id = ?",
        )
        .bind(task_instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let header = StateRow::from_row(&row).map_err(query_error)?;
        let log = load_log(&self.pool.reader, task_instance_id).await?;
        header.into_state(log).map(Some)
    }

    async fn save_state(&self, state: &DurableExecutionState) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let stored = load_log(&mut *tx, &state.task_instance_id).await?;
        let changes = plan_changes(&stored, &state.suspend_log)?;

        sqlx::query(
            "INSERT INTO durable_states (task_instance_id, sequence_cursor, status, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(task_instance_id) DO UPDATE SET
                 sequence_cursor = excluded.sequence_cursor,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
        )
        .bind(state.task_instance_id.to_string())
        .bind(state.sequence_cursor as i64)
        .bind(to_json(&state.status, "durable status")?)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        for change in changes {
            match change {
                LogChange::Append(entry) => {
                    let outcome = entry
                        .outcome
                        .as_ref()
                        .map(|o| to_json(o, "outcome"))
                        .transpose()?;
                    sqlx::query(
                        "INSERT INTO suspend_log
                             (task_instance_id, sequence, condition, fingerprint, anchored_at, deadline, outcome)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(state.task_instance_id.to_string())
                    .bind(entry.sequence as i64)
                    .bind(to_json(&entry.condition, "condition")?)
                    .bind(&entry.fingerprint)
                    .bind(format_datetime(&entry.anchored_at))
                    .bind(entry.deadline.as_ref().map(format_datetime))
                    .bind(outcome)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        if let sqlx::Error::Database(ref db_err) = e {
                            if db_err.message().contains("UNIQUE") {
                                return RepositoryError::Conflict(format!(
                                    "suspend log entry {} already exists for {}",
                                    entry.sequence, state.task_instance_id
                                ));
                            }
                        }
                        query_error(e)
                    })?;
                }
                LogChange::Resolve(entry) => {
                    let outcome = entry
                        .outcome
                        .as_ref()
                        .map(|o| to_json(o, "outcome"))
                        .transpose()?;
                    sqlx::query(
                        "UPDATE suspend_log SET outcome = ?
                         WHERE task_instance_id = ? AND sequence = ? AND outcome IS NULL",
                    )
                    .bind(outcome)
                    .bind(state.task_instance_id.to_string())
                    .bind(entry.sequence as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error)?;
                }
            }
        }

        tx.commit().await.map_err(query_error)?;
        tracing::debug!(
            instance = %state.task_instance_id,
            status = %state.status,
            entries = state.suspend_log.len(),
            "durable state saved"
        );
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<DurableExecutionState>, RepositoryError> {
        let headers = sqlx::query(
            "SELECT task_instance_id, sequence_cursor, status FROM durable_states
             ORDER BY updated_at DESC, task_instance_id DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let log_rows = sqlx::query("SELECT * FROM suspend_log ORDER BY task_instance_id, sequence ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut logs: HashMap<String, Vec<SuspendLogEntry>> = HashMap::new();
        for row in &log_rows {
            let row = LogRow::from_row(row).map_err(query_error)?;
            let instance = row.task_instance_id.clone();
            logs.entry(instance).or_default().push(row.into_entry()?);
        }

        headers
            .iter()
            .map(|row| {
                let header = StateRow::from_row(row).map_err(query_error)?;
                let log = logs.remove(&header.task_instance_id).unwrap_or_default();
                header.into_state(log)
            })
            .collect()
    }

    async fn delete_state(&self, task_instance_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM durable_states WHERE task_instance_id = ?")
            .bind(task_instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
