//! Worker lifecycle events.
//!
//! `WorkerEvent` is broadcast on the worker's event bus. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{RunStatus, TaskFailure};
use crate::workflow::Priority;

/// Events emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkflowRegistered {
        workflow: String,
        tasks: usize,
    },

    RunSubmitted {
        run_id: Uuid,
        workflow: String,
        priority: Priority,
    },

    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },

    TaskStarted {
        run_id: Uuid,
        task: String,
        retry_count: u32,
    },

    TaskCompleted {
        run_id: Uuid,
        task: String,
        duration_ms: u64,
    },

    TaskFailed {
        run_id: Uuid,
        task: String,
        error: TaskFailure,
        will_retry: bool,
    },

    /// A durable task parked at a suspension point.
    TaskSuspended {
        run_id: Uuid,
        task: String,
        sequence: u64,
    },

    /// A durable task passed a suspension point.
    TaskResumed {
        run_id: Uuid,
        task: String,
        sequence: u64,
        /// The outcome came from the replay log rather than the engine.
        replayed: bool,
    },

    EventPushed {
        key: String,
    },
}

impl WorkerEvent {
    /// Run this event refers to, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            WorkerEvent::RunSubmitted { run_id, .. }
            | WorkerEvent::RunFinished { run_id, .. }
            | WorkerEvent::TaskStarted { run_id, .. }
            | WorkerEvent::TaskCompleted { run_id, .. }
            | WorkerEvent::TaskFailed { run_id, .. }
            | WorkerEvent::TaskSuspended { run_id, .. }
            | WorkerEvent::TaskResumed { run_id, .. } => Some(*run_id),
            WorkerEvent::WorkflowRegistered { .. } | WorkerEvent::EventPushed { .. } => None,
        }
    }
}
