//! `TaskContext`: the runtime object handed to every task handler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use taskloom_types::condition::Condition;
use taskloom_types::durable::{DurableExecutionState, SuspendOutcome};
use taskloom_types::workflow::Priority;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::TaskAssignment;
use crate::handler::TaskError;
use crate::workflow::durable::{DurableContext, SleepResult};

/// Read-only view of the current attempt, plus durable suspension for
/// durable tasks. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

struct Inner {
    workflow: String,
    task: String,
    run_id: Uuid,
    task_instance_id: Uuid,
    retry_count: u32,
    priority: Priority,
    additional_metadata: Map<String, Value>,
    parent_outputs: BTreeMap<String, Value>,
    gate_payload: Value,
    cancellation: CancellationToken,
    durable: Option<Mutex<DurableContext>>,
}

impl TaskContext {
    /// Context for one engine assignment. `durable` is set for durable tasks.
    pub fn from_assignment(assignment: &TaskAssignment, durable: Option<DurableContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workflow: assignment.workflow.clone(),
                task: assignment.task.clone(),
                run_id: assignment.run_id,
                task_instance_id: assignment.task_instance_id,
                retry_count: assignment.retry_count,
                priority: assignment.priority,
                additional_metadata: assignment.additional_metadata.clone(),
                parent_outputs: assignment.parent_outputs.clone(),
                gate_payload: assignment.gate_payload.clone(),
                cancellation: assignment.cancellation.clone(),
                durable: durable.map(Mutex::new),
            }),
        }
    }

    /// A context outside any run, for calling handlers directly.
    pub fn detached(workflow: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workflow: workflow.into(),
                task: task.into(),
                run_id: Uuid::nil(),
                task_instance_id: Uuid::nil(),
                retry_count: 0,
                priority: Priority::BASELINE,
                additional_metadata: Map::new(),
                parent_outputs: BTreeMap::new(),
                gate_payload: Value::Object(Map::new()),
                cancellation: CancellationToken::new(),
                durable: None,
            }),
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow
    }

    pub fn task_name(&self) -> &str {
        &self.inner.task
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn task_instance_id(&self) -> Uuid {
        self.inner.task_instance_id
    }

    /// 0 on the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count
    }

    /// Resolved priority of this task in this run.
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn additional_metadata(&self) -> &Map<String, Value> {
        &self.inner.additional_metadata
    }

    /// Output of a completed parent task.
    pub fn parent_output(&self, name: &str) -> Option<&Value> {
        self.inner.parent_outputs.get(name)
    }

    /// Parent output decoded into `T`.
    pub fn parent_output_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let value = self
            .parent_output(name)
            .ok_or_else(|| TaskError::non_retryable(format!("no output from parent '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::non_retryable(format!("parent '{name}' output: {e}")))
    }

    /// Outcome of the task's `wait_for` start gate (`{}` without one).
    pub fn gate_payload(&self) -> &Value {
        &self.inner.gate_payload
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn is_durable(&self) -> bool {
        self.inner.durable.is_some()
    }

    /// Durable sleep. Resumes with the originally anchored deadline after a
    /// restart.
    pub async fn sleep_for(&self, duration: Duration) -> Result<SleepResult, TaskError> {
        let mut durable = self.durable()?.lock().await;
        Ok(durable.sleep_for(duration).await?)
    }

    /// Durable wait on a condition tree.
    pub async fn wait_for(&self, condition: Condition) -> Result<SuspendOutcome, TaskError> {
        let mut durable = self.durable()?.lock().await;
        Ok(durable.wait_for(condition).await?)
    }

    /// Snapshot of the durable state, if this task is durable.
    pub async fn durable_state(&self) -> Option<DurableExecutionState> {
        match &self.inner.durable {
            Some(durable) => Some(durable.lock().await.state().clone()),
            None => None,
        }
    }

    pub(crate) fn durable_context(&self) -> Option<&Mutex<DurableContext>> {
        self.inner.durable.as_ref()
    }

    fn durable(&self) -> Result<&Mutex<DurableContext>, TaskError> {
        self.inner
            .durable
            .as_ref()
            .ok_or_else(|| TaskError::non_retryable("task is not durable"))
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("workflow", &self.inner.workflow)
            .field("task", &self.inner.task)
            .field("run_id", &self.inner.run_id)
            .field("retry_count", &self.inner.retry_count)
            .field("durable", &self.inner.durable.is_some())
            .finish()
    }
}
