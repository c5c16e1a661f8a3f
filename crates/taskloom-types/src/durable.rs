//! Durable execution state for Taskloom.
//!
//! A durable task instance records every suspension point (`sleep_for`,
//! `wait_for`) in an append-only, sequence-numbered log. Re-running the
//! handler after a crash replays the log instead of re-registering waits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;

/// Lifecycle of one durable task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DurableStatus {
    Running,
    /// Parked at suspension point `sequence`.
    Suspended { sequence: u64 },
    /// The condition at `sequence` was satisfied; the outcome is being injected.
    Resuming { sequence: u64 },
    Completed,
    Failed,
    Cancelled,
}

impl DurableStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DurableStatus::Completed | DurableStatus::Failed | DurableStatus::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DurableStatus::Running => "running",
            DurableStatus::Suspended { .. } => "suspended",
            DurableStatus::Resuming { .. } => "resuming",
            DurableStatus::Completed => "completed",
            DurableStatus::Failed => "failed",
            DurableStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DurableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurableStatus::Suspended { sequence } => write!(f, "suspended({sequence})"),
            DurableStatus::Resuming { sequence } => write!(f, "resuming({sequence})"),
            other => f.write_str(other.name()),
        }
    }
}

/// The recorded result of a satisfied suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendOutcome {
    pub resolved_at: DateTime<Utc>,
    /// Payloads keyed by leaf readable id (`"event:user:update"`,
    /// `"sleep:10s"`). Sleep leaves contribute `null`.
    pub payload: serde_json::Value,
}

/// One entry of the suspend log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendLogEntry {
    /// 1-based, dense and monotonic per task instance.
    pub sequence: u64,
    pub condition: Condition,
    /// Hex SHA-256 of the canonical condition JSON.
    pub fingerprint: String,
    /// Engine-anchored start of the wait. Sleep deadlines derive from this.
    pub anchored_at: DateTime<Utc>,
    /// Deadline for conditions containing a sleep leaf on the resolving path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SuspendOutcome>,
}

impl SuspendLogEntry {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Per-instance durable state, persisted across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableExecutionState {
    pub task_instance_id: Uuid,
    /// Sequence number of the last suspension point reached by the handler
    /// in the current execution. Resets to 0 when the handler restarts.
    pub sequence_cursor: u64,
    pub status: DurableStatus,
    pub suspend_log: Vec<SuspendLogEntry>,
}

impl DurableExecutionState {
    pub fn new(task_instance_id: Uuid) -> Self {
        Self {
            task_instance_id,
            sequence_cursor: 0,
            status: DurableStatus::Running,
            suspend_log: Vec::new(),
        }
    }

    /// Highest recorded sequence number (0 when the log is empty).
    pub fn last_sequence(&self) -> u64 {
        self.suspend_log.last().map(|e| e.sequence).unwrap_or(0)
    }
}
