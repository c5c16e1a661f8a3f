//! Run-level records exchanged between the worker and the engine.
//!
//! A run submission carries everything the engine needs to admit and schedule
//! a run: the trigger input, resolved priorities and the concrete admission
//! plan (group keys and bucket requests). Results and task reports flow back.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ConcurrencyLimitStrategy, Priority, RateLimitDuration};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

/// Status of one task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    /// Parents have not all finished.
    Pending,
    /// Parents finished; a start gate is not yet decided.
    Waiting,
    /// Ready to run, waiting for a slot, a rate-limit window or a retry delay.
    Queued,
    Running,
    Completed,
    Skipped,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunStatus::Completed
                | TaskRunStatus::Skipped
                | TaskRunStatus::Failed
                | TaskRunStatus::Cancelled
                | TaskRunStatus::TimedOut
        )
    }

    /// Whether children may start after a parent ends in this state.
    pub fn unblocks_children(&self) -> bool {
        matches!(self, TaskRunStatus::Completed | TaskRunStatus::Skipped)
    }
}

// ---------------------------------------------------------------------------
// Errors crossing the boundary
// ---------------------------------------------------------------------------

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input did not match the handler's schema.
    Validation,
    /// An expression failed against the actual input shape.
    Expression,
    /// Explicit terminal failure. Never retried.
    NonRetryable,
    /// Anything else. Subject to the retry policy.
    Transient,
    Cancelled,
    Timeout,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// A failure as reported to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Admission plan
// ---------------------------------------------------------------------------

/// Where a concurrency group applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", content = "task", rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Whole runs of the workflow.
    Workflow,
    /// Instances of one task.
    Task(String),
}

/// A concurrency expression evaluated against a concrete input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConcurrency {
    pub scope: ConcurrencyScope,
    /// The source expression.
    pub expression: String,
    pub group_key: String,
    pub max_runs: u32,
    pub strategy: ConcurrencyLimitStrategy,
}

/// A rate-limit declaration resolved to a concrete bucket request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRateLimit {
    /// Task consuming the units.
    pub task: String,
    pub bucket_key: String,
    pub units: u32,
    /// Present for dynamic keys (inline bucket definition).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<RateLimitDuration>,
}

/// Everything the admission resolver produced for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPlan {
    pub concurrency: Vec<ResolvedConcurrency>,
    pub rate_limits: Vec<ResolvedRateLimit>,
}

impl AdmissionPlan {
    /// Workflow-scoped concurrency entries, in declaration order.
    pub fn workflow_concurrency(&self) -> impl Iterator<Item = &ResolvedConcurrency> {
        self.concurrency
            .iter()
            .filter(|c| c.scope == ConcurrencyScope::Workflow)
    }

    /// Concurrency entries scoped to `task`, in declaration order.
    pub fn task_concurrency<'a>(
        &'a self,
        task: &'a str,
    ) -> impl Iterator<Item = &'a ResolvedConcurrency> + 'a {
        self.concurrency
            .iter()
            .filter(move |c| matches!(&c.scope, ConcurrencyScope::Task(name) if name == task))
    }

    /// Bucket requests for `task`.
    pub fn task_rate_limits<'a>(
        &'a self,
        task: &'a str,
    ) -> impl Iterator<Item = &'a ResolvedRateLimit> + 'a {
        self.rate_limits.iter().filter(move |r| r.task == task)
    }

    pub fn is_empty(&self) -> bool {
        self.concurrency.is_empty() && self.rate_limits.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Submission and results
// ---------------------------------------------------------------------------

/// A run request as submitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSubmission {
    pub run_id: Uuid,
    pub workflow: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub additional_metadata: serde_json::Map<String, serde_json::Value>,
    /// Explicit per-run override, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_override: Option<Priority>,
    /// Effective priority of each task (run override > task > workflow > baseline).
    pub task_priorities: BTreeMap<String, Priority>,
    pub admission: AdmissionPlan,
    pub submitted_at: DateTime<Utc>,
}

impl RunSubmission {
    pub fn priority_of(&self, task: &str) -> Priority {
        self.task_priorities
            .get(task)
            .copied()
            .or(self.priority_override)
            .unwrap_or(Priority::BASELINE)
    }
}

/// Final state of one task in a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub status: TaskRunStatus,
    /// Execution attempts started (0 if the task never ran).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl TaskRunRecord {
    pub fn pending() -> Self {
        Self {
            status: TaskRunStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
        }
    }
}

/// Terminal result delivered through a run handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub tasks: BTreeMap<String, TaskRunRecord>,
    /// The last error that made the run fail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl RunResult {
    /// Output of a completed task.
    pub fn output(&self, task: &str) -> Option<&serde_json::Value> {
        self.tasks.get(task).and_then(|t| t.output.as_ref())
    }

    /// Attempts made for a task (0 if unknown).
    pub fn attempts(&self, task: &str) -> u32 {
        self.tasks.get(task).map(|t| t.attempts).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Task reports
// ---------------------------------------------------------------------------

/// What happened to one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        output: serde_json::Value,
    },
    Failed {
        error: TaskFailure,
        /// `Some(delay)` asks the engine to schedule another attempt.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "optional_duration"
        )]
        retry_in: Option<Duration>,
    },
    Cancelled,
}

/// Attempt result sent from the worker to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: Uuid,
    pub task: String,
    /// 0-based retry count of the attempt being reported.
    pub retry_count: u32,
    pub outcome: TaskOutcome,
}

mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::duration::{format_duration, parse_duration};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
