//! Ports to the orchestration engine.
//!
//! The engine owns scheduling, queuing, timers and persistence of runs. The
//! client side only submits declarations and resolved policies, executes the
//! assignments it is handed, and reports back. Two traits split the surface:
//!
//! - [`WorkflowEngine`]: registration, run submission, cancellation, events,
//!   the assignment stream and attempt reports.
//! - [`SuspensionBroker`]: durable suspension registration and resolution
//!   notifications, used by `DurableContext`.
//!
//! Both use native async fn in traits (RPITIT). `BoxWorkflowEngine` and
//! `BoxSuspensionBroker` provide type-erased wrappers.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use taskloom_types::condition::Condition;
use taskloom_types::durable::SuspendOutcome;
use taskloom_types::run::{RunResult, RunSubmission, TaskReport};
use taskloom_types::workflow::{Priority, StaticRateLimit, WorkflowSpec};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("unknown run {0}")]
    UnknownRun(Uuid),

    #[error("unknown static rate limit '{0}'")]
    UnknownRateLimit(String),

    #[error("no suspension registered for instance {instance} at sequence {sequence}")]
    UnknownSuspension { instance: Uuid, sequence: u64 },

    #[error("suspension {sequence} of instance {instance} was registered with a different condition")]
    SuspensionConflict { instance: Uuid, sequence: u64 },

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("engine channel closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Wire-level records
// ---------------------------------------------------------------------------

/// One attempt of one task, handed to a worker.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub run_id: Uuid,
    pub workflow: String,
    pub task: String,
    /// Stable across retries of the same task in the same run.
    pub task_instance_id: Uuid,
    /// 0 on the first attempt.
    pub retry_count: u32,
    pub priority: Priority,
    pub input: serde_json::Value,
    pub additional_metadata: serde_json::Map<String, serde_json::Value>,
    /// Outputs of completed parents, keyed by task name.
    pub parent_outputs: BTreeMap<String, serde_json::Value>,
    /// Outcome of the task's `wait_for` gate (`{}` without one).
    pub gate_payload: serde_json::Value,
    /// Fires when the engine cancels this attempt.
    pub cancellation: CancellationToken,
}

/// A durable suspension point as registered with the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspensionRequest {
    pub task_instance_id: Uuid,
    pub sequence: u64,
    /// Canonical form.
    pub condition: Condition,
    pub fingerprint: String,
}

/// Engine acknowledgement of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspensionTicket {
    /// Engine-anchored start of the wait.
    pub anchored_at: DateTime<Utc>,
}

/// Result channel of a submitted run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    receiver: watch::Receiver<Option<RunResult>>,
}

impl RunHandle {
    pub fn new(run_id: Uuid, receiver: watch::Receiver<Option<RunResult>>) -> Self {
        Self { run_id, receiver }
    }

    /// The result if the run already finished.
    pub fn try_result(&self) -> Option<RunResult> {
        self.receiver.borrow().clone()
    }

    /// Wait for the terminal result.
    pub async fn result(mut self) -> Result<RunResult, EngineError> {
        let done = self
            .receiver
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| EngineError::Closed)?;
        (*done).clone().ok_or(EngineError::Closed)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub trait WorkflowEngine: Send + Sync {
    /// Register (or replace) a workflow declaration.
    fn register_workflow(
        &self,
        spec: &WorkflowSpec,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Register (or update) a static rate-limit bucket.
    fn put_rate_limit(
        &self,
        limit: &StaticRateLimit,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Submit a run with its resolved priorities and admission plan.
    fn submit_run(
        &self,
        submission: RunSubmission,
    ) -> impl Future<Output = Result<RunHandle, EngineError>> + Send;

    /// Cancel a run. In-flight attempts observe their cancellation token.
    fn cancel_run(&self, run_id: Uuid) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Deliver an external event (gates, suspensions, event triggers).
    fn push_event(
        &self,
        key: &str,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Open the assignment stream for a worker.
    fn listen(
        &self,
        worker: &str,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError>> + Send;

    /// Report the outcome of an attempt.
    fn report(&self, report: TaskReport) -> impl Future<Output = Result<(), EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// SuspensionBroker
// ---------------------------------------------------------------------------

pub trait SuspensionBroker: Send + Sync {
    /// Register a suspension point. Registering the same
    /// `(instance, sequence, fingerprint)` again returns the original ticket.
    fn register_suspension(
        &self,
        request: SuspensionRequest,
    ) -> impl Future<Output = Result<SuspensionTicket, EngineError>> + Send;

    /// Wait until the registered condition is satisfied.
    fn await_resolution(
        &self,
        task_instance_id: Uuid,
        sequence: u64,
    ) -> impl Future<Output = Result<SuspendOutcome, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch wrappers
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`WorkflowEngine`] with boxed futures.
pub trait WorkflowEngineDyn: Send + Sync {
    fn register_workflow_boxed<'a>(
        &'a self,
        spec: &'a WorkflowSpec,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    fn put_rate_limit_boxed<'a>(
        &'a self,
        limit: &'a StaticRateLimit,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    fn submit_run_boxed(
        &self,
        submission: RunSubmission,
    ) -> BoxFuture<'_, Result<RunHandle, EngineError>>;

    fn cancel_run_boxed(&self, run_id: Uuid) -> BoxFuture<'_, Result<(), EngineError>>;

    fn push_event_boxed<'a>(
        &'a self,
        key: &'a str,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    fn listen_boxed<'a>(
        &'a self,
        worker: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError>>;

    fn report_boxed(&self, report: TaskReport) -> BoxFuture<'_, Result<(), EngineError>>;
}

impl<T: WorkflowEngine> WorkflowEngineDyn for T {
    fn register_workflow_boxed<'a>(
        &'a self,
        spec: &'a WorkflowSpec,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.register_workflow(spec))
    }

    fn put_rate_limit_boxed<'a>(
        &'a self,
        limit: &'a StaticRateLimit,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.put_rate_limit(limit))
    }

    fn submit_run_boxed(
        &self,
        submission: RunSubmission,
    ) -> BoxFuture<'_, Result<RunHandle, EngineError>> {
        Box::pin(self.submit_run(submission))
    }

    fn cancel_run_boxed(&self, run_id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.cancel_run(run_id))
    }

    fn push_event_boxed<'a>(
        &'a self,
        key: &'a str,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.push_event(key, payload))
    }

    fn listen_boxed<'a>(
        &'a self,
        worker: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError>> {
        Box::pin(self.listen(worker))
    }

    fn report_boxed(&self, report: TaskReport) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.report(report))
    }
}

/// Type-erased engine.
pub struct BoxWorkflowEngine {
    inner: Box<dyn WorkflowEngineDyn + Send + Sync>,
}

impl BoxWorkflowEngine {
    pub fn new<T: WorkflowEngine + 'static>(engine: T) -> Self {
        Self {
            inner: Box::new(engine),
        }
    }

    pub async fn register_workflow(&self, spec: &WorkflowSpec) -> Result<(), EngineError> {
        self.inner.register_workflow_boxed(spec).await
    }

    pub async fn put_rate_limit(&self, limit: &StaticRateLimit) -> Result<(), EngineError> {
        self.inner.put_rate_limit_boxed(limit).await
    }

    pub async fn submit_run(&self, submission: RunSubmission) -> Result<RunHandle, EngineError> {
        self.inner.submit_run_boxed(submission).await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.inner.cancel_run_boxed(run_id).await
    }

    pub async fn push_event(&self, key: &str, payload: serde_json::Value) -> Result<(), EngineError> {
        self.inner.push_event_boxed(key, payload).await
    }

    pub async fn listen(
        &self,
        worker: &str,
    ) -> Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError> {
        self.inner.listen_boxed(worker).await
    }

    pub async fn report(&self, report: TaskReport) -> Result<(), EngineError> {
        self.inner.report_boxed(report).await
    }
}

/// Object-safe version of [`SuspensionBroker`].
pub trait SuspensionBrokerDyn: Send + Sync {
    fn register_suspension_boxed(
        &self,
        request: SuspensionRequest,
    ) -> BoxFuture<'_, Result<SuspensionTicket, EngineError>>;

    fn await_resolution_boxed(
        &self,
        task_instance_id: Uuid,
        sequence: u64,
    ) -> BoxFuture<'_, Result<SuspendOutcome, EngineError>>;
}

impl<T: SuspensionBroker> SuspensionBrokerDyn for T {
    fn register_suspension_boxed(
        &self,
        request: SuspensionRequest,
    ) -> BoxFuture<'_, Result<SuspensionTicket, EngineError>> {
        Box::pin(self.register_suspension(request))
    }

    fn await_resolution_boxed(
        &self,
        task_instance_id: Uuid,
        sequence: u64,
    ) -> BoxFuture<'_, Result<SuspendOutcome, EngineError>> {
        Box::pin(self.await_resolution(task_instance_id, sequence))
    }
}

/// Type-erased suspension broker. Cheap to clone.
#[derive(Clone)]
pub struct BoxSuspensionBroker {
    inner: std::sync::Arc<dyn SuspensionBrokerDyn + Send + Sync>,
}

impl BoxSuspensionBroker {
    pub fn new<T: SuspensionBroker + 'static>(broker: T) -> Self {
        Self {
            inner: std::sync::Arc::new(broker),
        }
    }

    pub async fn register_suspension(
        &self,
        request: SuspensionRequest,
    ) -> Result<SuspensionTicket, EngineError> {
        self.inner.register_suspension_boxed(request).await
    }

    pub async fn await_resolution(
        &self,
        task_instance_id: Uuid,
        sequence: u64,
    ) -> Result<SuspendOutcome, EngineError> {
        self.inner.await_resolution_boxed(task_instance_id, sequence).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::run::RunStatus;

    #[tokio::test]
    async fn run_handle_resolves_when_result_published() {
        let run_id = Uuid::now_v7();
        let (tx, rx) = watch::channel(None);
        let handle = RunHandle::new(run_id, rx);
        assert!(handle.try_result().is_none());

        let waiter = tokio::spawn(handle.clone().result());
        tx.send(Some(RunResult {
            run_id,
            workflow: "wf".into(),
            status: RunStatus::Completed,
            tasks: BTreeMap::new(),
            error: None,
        }))
        .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(handle.try_result().is_some());
    }

    #[tokio::test]
    async fn run_handle_reports_closed_channel() {
        let (tx, rx) = watch::channel(None);
        let handle = RunHandle::new(Uuid::now_v7(), rx);
        drop(tx);
        assert!(matches!(handle.result().await, Err(EngineError::Closed)));
    }
}
