//! The worker: registration and run APIs on one side, assignment execution
//! on the other.
//!
//! A `Worker` owns its handler dispatch table, its static rate-limit
//! registry and an event bus; nothing is process-global. At trigger time
//! it validates the input, resolves admission and priorities locally and
//! submits the run. The engine then streams back assignments, which the
//! worker executes under the task's execution timeout and reports on.
//!
//! # Execution flow (one assignment)
//!
//! 1. Look up the handler and the task declaration.
//! 2. For durable tasks, open the `DurableContext` (replaying any state a
//!    previous attempt left behind).
//! 3. Validate input; a mismatch fails without invoking the handler.
//! 4. Run the handler, racing the execution timeout and cancellation. Time
//!    spent suspended in a durable wait does not count toward the timeout.
//! 5. Classify the result, ask the retry policy, finalize durable state and
//!    build the `TaskReport`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use taskloom_types::config::WorkerConfig;
use taskloom_types::event::WorkerEvent;
use taskloom_types::run::{RunResult, RunSubmission, TaskOutcome, TaskReport};
use taskloom_types::workflow::{Priority, StaticRateLimit, TaskId, TaskSpec};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::context::TaskContext;
use crate::engine::{
    BoxSuspensionBroker, BoxWorkflowEngine, EngineError, RunHandle, SuspensionBroker,
    TaskAssignment, WorkflowEngine,
};
use crate::event::{EventBus, RunEvents};
use crate::handler::{HandlerRegistry, TaskError};
use crate::repository::BoxDurableLogRepository;
use crate::workflow::admission::{AdmissionError, AdmissionResolver, RateLimitRegistry};
use crate::workflow::builder::Workflow;
use crate::workflow::definition::WorkflowError;
use crate::workflow::durable::{DurableContext, ExecutionBudget};
use crate::workflow::priority::resolve_priority;
use crate::workflow::retry::{RetryDecision, RetryHandler};

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("workflow '{0}' is not registered with this worker")]
    UnknownWorkflow(String),

    #[error("invalid input for task '{task}': {reason}")]
    InvalidInput { task: String, reason: String },
}

/// Per-run options for [`Worker::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides every task's priority for this run.
    pub priority: Option<Priority>,
    pub additional_metadata: Map<String, Value>,
}

impl RunOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    config: WorkerConfig,
    engine: BoxWorkflowEngine,
    broker: BoxSuspensionBroker,
    repository: BoxDurableLogRepository,
    handlers: HandlerRegistry,
    rate_limits: RateLimitRegistry,
    workflows: DashMap<String, Workflow>,
    events: EventBus,
    clock: SharedClock,
}

impl Worker {
    /// Worker against an engine that also brokers durable suspensions.
    pub fn new<E>(config: WorkerConfig, engine: E, repository: BoxDurableLogRepository) -> Self
    where
        E: WorkflowEngine + SuspensionBroker + Clone + 'static,
    {
        Self::with_clock(config, engine, repository, Arc::new(SystemClock))
    }

    pub fn with_clock<E>(
        config: WorkerConfig,
        engine: E,
        repository: BoxDurableLogRepository,
        clock: SharedClock,
    ) -> Self
    where
        E: WorkflowEngine + SuspensionBroker + Clone + 'static,
    {
        Self::from_parts(
            config,
            BoxWorkflowEngine::new(engine.clone()),
            BoxSuspensionBroker::new(engine),
            repository,
            clock,
        )
    }

    pub fn from_parts(
        config: WorkerConfig,
        engine: BoxWorkflowEngine,
        broker: BoxSuspensionBroker,
        repository: BoxDurableLogRepository,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                config,
                engine,
                broker,
                repository,
                handlers: HandlerRegistry::new(),
                rate_limits: RateLimitRegistry::new(),
                workflows: DashMap::new(),
                events: EventBus::new(256),
                clock,
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events of one run only.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        self.inner.events.subscribe_run(run_id)
    }

    /// Names of registered workflows (namespaced).
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Register a workflow with the engine and bind its handlers.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), WorkerError> {
        let name = self.inner.config.namespaced(workflow.name());
        let workflow = workflow.renamed(name.clone());

        self.inner.engine.register_workflow(workflow.spec()).await?;

        self.inner.handlers.remove_workflow(&name);
        for (task, handler) in workflow.handlers() {
            self.inner
                .handlers
                .insert(TaskId::new(name.clone(), task), handler.clone());
        }
        let tasks = workflow.spec().tasks.len();
        self.inner.workflows.insert(name.clone(), workflow);

        tracing::info!(workflow = %name, tasks, "workflow registered");
        self.inner
            .events
            .publish(WorkerEvent::WorkflowRegistered { workflow: name, tasks });
        Ok(())
    }

    /// Register (or update) a static rate-limit bucket.
    pub async fn put_rate_limit(&self, limit: StaticRateLimit) -> Result<(), WorkerError> {
        self.inner.engine.put_rate_limit(&limit).await?;
        tracing::debug!(key = %limit.key, limit = limit.limit, "static rate limit registered");
        self.inner.rate_limits.put(limit);
        Ok(())
    }

    /// Trigger a run. Input, admission and priorities are checked here;
    /// nothing reaches the engine if any of them fails.
    pub async fn run(
        &self,
        workflow: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunHandle, WorkerError> {
        let submission = self.prepare_submission(workflow, input, options)?;
        let run_id = submission.run_id;
        let workflow = submission.workflow.clone();
        let priority = submission
            .priority_override
            .unwrap_or_else(|| submission.task_priorities.values().copied().max().unwrap_or_default());

        let handle = self.inner.engine.submit_run(submission).await?;

        tracing::info!(run_id = %run_id, workflow = %workflow, ?priority, "run submitted");
        self.inner.events.publish(WorkerEvent::RunSubmitted {
            run_id,
            workflow,
            priority,
        });
        Ok(handle)
    }

    /// Trigger a run and wait for its terminal result.
    pub async fn run_and_wait(
        &self,
        workflow: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunResult, WorkerError> {
        let handle = self.run(workflow, input, options).await?;
        let result = handle.result().await?;
        tracing::info!(run_id = %result.run_id, status = ?result.status, "run finished");
        self.inner.events.publish(WorkerEvent::RunFinished {
            run_id: result.run_id,
            status: result.status,
        });
        Ok(result)
    }

    pub async fn push_event(&self, key: &str, payload: Value) -> Result<(), WorkerError> {
        self.inner.engine.push_event(key, payload).await?;
        tracing::debug!(key, "event pushed");
        self.inner
            .events
            .publish(WorkerEvent::EventPushed { key: key.to_string() });
        Ok(())
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<(), WorkerError> {
        self.inner.engine.cancel_run(run_id).await?;
        tracing::info!(run_id = %run_id, "run cancellation requested");
        Ok(())
    }

    /// Build the submission for a run. Synchronous: the expression
    /// evaluator is not `Send` and must not live across an await.
    fn prepare_submission(
        &self,
        workflow: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunSubmission, WorkerError> {
        let name = self.inner.config.namespaced(workflow);
        let entry = self
            .inner
            .workflows
            .get(&name)
            .ok_or_else(|| WorkerError::UnknownWorkflow(name.clone()))?;
        let workflow = entry.value();

        for (task, handler) in workflow.root_handlers() {
            handler
                .validate_input(&input)
                .map_err(|e| WorkerError::InvalidInput {
                    task: task.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let spec = workflow.spec();
        let admission = AdmissionResolver::new().resolve(
            spec,
            &input,
            &options.additional_metadata,
            &self.inner.rate_limits,
        )?;

        let workflow_default = spec.default_priority.or(Some(self.inner.config.default_priority));
        let task_priorities: BTreeMap<String, Priority> = spec
            .tasks
            .iter()
            .chain(spec.on_failure.iter())
            .chain(spec.on_success.iter())
            .map(|task| {
                (
                    task.name.clone(),
                    resolve_priority(options.priority, task.default_priority, workflow_default),
                )
            })
            .collect();

        Ok(RunSubmission {
            run_id: Uuid::now_v7(),
            workflow: name,
            input,
            additional_metadata: options.additional_metadata,
            priority_override: options.priority,
            task_priorities,
            admission,
            submitted_at: self.inner.clock.now(),
        })
    }

    fn task_spec(&self, workflow: &str, task: &str) -> Option<TaskSpec> {
        self.inner
            .workflows
            .get(workflow)
            .and_then(|w| w.spec().task(task).cloned())
    }

    // -----------------------------------------------------------------------
    // Assignment execution
    // -----------------------------------------------------------------------

    /// Execute one assignment and build the report for the engine.
    pub async fn execute_assignment(&self, assignment: TaskAssignment) -> TaskReport {
        let started = Instant::now();
        let run_id = assignment.run_id;
        let task = assignment.task.clone();

        tracing::debug!(
            run_id = %run_id,
            task = %task,
            retry_count = assignment.retry_count,
            "executing assignment"
        );
        self.inner.events.publish(WorkerEvent::TaskStarted {
            run_id,
            task: task.clone(),
            retry_count: assignment.retry_count,
        });

        let id = TaskId::new(assignment.workflow.clone(), task.clone());
        let (Some(handler), Some(spec)) = (
            self.inner.handlers.get(&id),
            self.task_spec(&assignment.workflow, &task),
        ) else {
            let err = TaskError::non_retryable(format!("no handler bound for {id}"));
            return self.report_failure(&assignment, None, err, None).await;
        };

        let budget = Arc::new(ExecutionBudget::new(spec.execution_timeout));
        let durable = if spec.durable {
            let opened = DurableContext::open(
                assignment.task_instance_id,
                self.inner.broker.clone(),
                self.inner.repository.clone(),
                self.inner.clock.clone(),
                assignment.cancellation.clone(),
            )
            .await;
            match opened {
                Ok(ctx) => Some(
                    ctx.with_events(self.inner.events.clone(), run_id, task.clone())
                        .with_budget(budget.clone()),
                ),
                Err(e) => {
                    return self
                        .report_failure(&assignment, Some(&spec), TaskError::from(e), None)
                        .await;
                }
            }
        } else {
            None
        };

        let ctx = TaskContext::from_assignment(&assignment, durable);

        let result = match handler.validate_input(&assignment.input) {
            Err(e) => Err(e),
            Ok(()) => {
                let execution = handler.execute(assignment.input.clone(), ctx.clone());
                tokio::select! {
                    biased;
                    _ = assignment.cancellation.cancelled() => Err(TaskError::Cancelled),
                    result = execution => result,
                    _ = budget.exhausted() => Err(TaskError::Timeout(budget.limit())),
                }
            }
        };

        match result {
            Ok(output) => {
                if let Some(durable) = ctx.durable_context() {
                    finalize(durable, Finalize::Complete).await;
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(run_id = %run_id, task = %task, duration_ms, "task completed");
                self.inner.events.publish(WorkerEvent::TaskCompleted {
                    run_id,
                    task: task.clone(),
                    duration_ms,
                });
                TaskReport {
                    run_id,
                    task,
                    retry_count: assignment.retry_count,
                    outcome: TaskOutcome::Completed { output },
                }
            }
            Err(err) => {
                self.report_failure(&assignment, Some(&spec), err, ctx.durable_context())
                    .await
            }
        }
    }

    async fn report_failure(
        &self,
        assignment: &TaskAssignment,
        spec: Option<&TaskSpec>,
        err: TaskError,
        durable: Option<&Mutex<DurableContext>>,
    ) -> TaskReport {
        let failure = err.to_failure();
        let decision = match spec {
            Some(spec) => RetryHandler::decide(&spec.retry, assignment.retry_count, failure.kind),
            None => RetryDecision::GiveUp,
        };
        let retry_in = match decision {
            RetryDecision::Retry { delay } => Some(delay),
            RetryDecision::GiveUp => None,
        };

        if let Some(durable) = durable {
            let action = match (&err, retry_in) {
                (TaskError::Cancelled, _) => Finalize::Cancel,
                (_, Some(_)) => Finalize::Checkpoint,
                (_, None) => Finalize::Fail,
            };
            finalize(durable, action).await;
        }

        let outcome = if matches!(err, TaskError::Cancelled) {
            tracing::info!(run_id = %assignment.run_id, task = %assignment.task, "task cancelled");
            TaskOutcome::Cancelled
        } else {
            tracing::warn!(
                run_id = %assignment.run_id,
                task = %assignment.task,
                retry_count = assignment.retry_count,
                error = %failure,
                retry_in = ?retry_in,
                "task failed"
            );
            self.inner.events.publish(WorkerEvent::TaskFailed {
                run_id: assignment.run_id,
                task: assignment.task.clone(),
                error: failure.clone(),
                will_retry: retry_in.is_some(),
            });
            TaskOutcome::Failed {
                error: failure,
                retry_in,
            }
        };

        TaskReport {
            run_id: assignment.run_id,
            task: assignment.task.clone(),
            retry_count: assignment.retry_count,
            outcome,
        }
    }

    // -----------------------------------------------------------------------
    // Listen loop
    // -----------------------------------------------------------------------

    /// Pull assignments until `shutdown` fires, running at most
    /// `config.slots` at once. In-flight work gets `shutdown_grace_secs` to
    /// finish before it is aborted.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let config = &self.inner.config;
        let mut assignments = self.inner.engine.listen(&config.name).await?;
        let slots = Arc::new(Semaphore::new(config.slots.max(1)));
        let mut join_set = JoinSet::new();

        tracing::info!(worker = %config.name, slots = config.slots.max(1), "worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let assignment = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = assignments.recv() => match next {
                    Some(assignment) => assignment,
                    None => break,
                },
            };

            while let Some(done) = join_set.try_join_next() {
                if let Err(e) = done {
                    tracing::warn!(error = %e, "assignment task failed to join");
                }
            }

            let worker = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let report = worker.execute_assignment(assignment).await;
                if let Err(e) = worker.inner.engine.report(report).await {
                    tracing::warn!(error = %e, "failed to report task outcome");
                }
            });
        }

        let grace = Duration::from_secs(config.shutdown_grace_secs);
        let drain = async { while join_set.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(
                in_flight = join_set.len(),
                "shutdown grace period elapsed, aborting in-flight assignments"
            );
            join_set.abort_all();
        }

        tracing::info!(worker = %config.name, "worker stopped");
        Ok(())
    }
}

enum Finalize {
    Complete,
    Fail,
    Cancel,
    /// Keep state for the next attempt.
    Checkpoint,
}

async fn finalize(durable: &Mutex<DurableContext>, action: Finalize) {
    let mut ctx = durable.lock().await;
    let result = match action {
        Finalize::Complete => ctx.complete().await,
        Finalize::Cancel => ctx.cancel().await,
        Finalize::Checkpoint => ctx.checkpoint().await,
        Finalize::Fail => match ctx.fail().await {
            Ok(()) => Ok(()),
            // Timed out while suspended: FAILED is not reachable from there.
            Err(_) => ctx.cancel().await,
        },
    };
    if let Err(e) = result {
        tracing::warn!(instance = %ctx.task_instance_id(), error = %e, "failed to finalize durable state");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use taskloom_types::durable::{DurableExecutionState, SuspendOutcome};
    use taskloom_types::error::RepositoryError;
    use taskloom_types::run::FailureKind;
    use taskloom_types::workflow::{
        ConcurrencyExpression, ConcurrencyLimitStrategy, RateLimitDuration, RateLimitSpec,
        WorkflowSpec,
    };
    use tokio::sync::mpsc;

    use crate::engine::{SuspensionRequest, SuspensionTicket};
    use crate::handler::handler_fn;
    use crate::repository::DurableLogRepository;
    use crate::workflow::builder::{TaskDefinition, WorkflowBuilder};

    // -- stub engine --------------------------------------------------------

    #[derive(Clone, Default)]
    struct StubEngine {
        submissions: Arc<std::sync::Mutex<Vec<RunSubmission>>>,
        registered: Arc<std::sync::Mutex<Vec<WorkflowSpec>>>,
    }

    impl WorkflowEngine for StubEngine {
        async fn register_workflow(&self, spec: &WorkflowSpec) -> Result<(), EngineError> {
            self.registered.lock().unwrap().push(spec.clone());
            Ok(())
        }

        async fn put_rate_limit(&self, _limit: &StaticRateLimit) -> Result<(), EngineError> {
            Ok(())
        }

        async fn submit_run(&self, submission: RunSubmission) -> Result<RunHandle, EngineError> {
            let run_id = submission.run_id;
            self.submissions.lock().unwrap().push(submission);
            let (_tx, rx) = tokio::sync::watch::channel(None);
            Ok(RunHandle::new(run_id, rx))
        }

        async fn cancel_run(&self, _run_id: Uuid) -> Result<(), EngineError> {
            Ok(())
        }

        async fn push_event(&self, _key: &str, _payload: Value) -> Result<(), EngineError> {
            Ok(())
        }

        async fn listen(
            &self,
            _worker: &str,
        ) -> Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn report(&self, _report: TaskReport) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl SuspensionBroker for StubEngine {
        async fn register_suspension(
            &self,
            request: SuspensionRequest,
        ) -> Result<SuspensionTicket, EngineError> {
            Err(EngineError::UnknownSuspension {
                instance: request.task_instance_id,
                sequence: request.sequence,
            })
        }

        async fn await_resolution(
            &self,
            task_instance_id: Uuid,
            sequence: u64,
        ) -> Result<SuspendOutcome, EngineError> {
            Err(EngineError::UnknownSuspension {
                instance: task_instance_id,
                sequence,
            })
        }
    }

    #[derive(Clone, Default)]
    struct NullRepo;

    impl DurableLogRepository for NullRepo {
        async fn load_state(
            &self,
            _id: &Uuid,
        ) -> Result<Option<DurableExecutionState>, RepositoryError> {
            Ok(None)
        }

        async fn save_state(&self, _state: &DurableExecutionState) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn list_states(&self) -> Result<Vec<DurableExecutionState>, RepositoryError> {
            Ok(vec![])
        }

        async fn delete_state(&self, _id: &Uuid) -> Result<bool, RepositoryError> {
            Ok(false)
        }
    }

    fn worker(engine: StubEngine) -> Worker {
        Worker::new(
            WorkerConfig::named("test"),
            engine,
            BoxDurableLogRepository::new(NullRepo),
        )
    }

    #[derive(serde::Deserialize, schemars::JsonSchema)]
    struct OrderInput {
        tenant: String,
    }

    fn order_workflow(calls: Arc<AtomicUsize>) -> Workflow {
        let mut builder = WorkflowBuilder::new("orders")
            .default_priority(Priority::Low)
            .concurrency(ConcurrencyExpression::new(
                "input.tenant",
                5,
                ConcurrencyLimitStrategy::CancelInProgress,
            ));
        let seen = calls.clone();
        let validate = builder
            .register_task(
                TaskDefinition::new(
                    "validate",
                    handler_fn(move |input: OrderInput, ctx: TaskContext| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            if ctx.retry_count() < 1 {
                                return Err(TaskError::transient("warming up"));
                            }
                            Ok(json!({ "tenant": input.tenant }))
                        }
                    }),
                )
                .default_priority(Priority::Medium)
                .retries(2)
                .backoff(2.0, 10),
            )
            .unwrap();
        builder
            .register_task(
                TaskDefinition::new(
                    "charge",
                    handler_fn(|_input: Value, _ctx: TaskContext| async move {
                        Err::<Value, _>(TaskError::non_retryable("card declined"))
                    }),
                )
                .parent(&validate)
                .retries(3)
                .rate_limit(RateLimitSpec::dynamic(
                    "input.tenant",
                    1,
                    10,
                    RateLimitDuration::Minute,
                )),
            )
            .unwrap();
        builder
            .register_task(
                TaskDefinition::new(
                    "slow",
                    handler_fn(|_input: Value, _ctx: TaskContext| async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, TaskError>(json!(null))
                    }),
                )
                .execution_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn assignment(task: &str, retry_count: u32, input: Value) -> TaskAssignment {
        TaskAssignment {
            run_id: Uuid::now_v7(),
            workflow: "orders".into(),
            task: task.into(),
            task_instance_id: Uuid::now_v7(),
            retry_count,
            priority: Priority::Medium,
            input,
            additional_metadata: Map::new(),
            parent_outputs: BTreeMap::new(),
            gate_payload: json!({}),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn run_resolves_priorities_and_admission() {
        let engine = StubEngine::default();
        let worker = worker(engine.clone());
        worker
            .register_workflow(order_workflow(Arc::default()))
            .await
            .unwrap();

        worker
            .run("orders", json!({ "tenant": "acme" }), RunOptions::default())
            .await
            .unwrap();
        worker
            .run(
                "orders",
                json!({ "tenant": "acme" }),
                RunOptions::default().priority(Priority::High),
            )
            .await
            .unwrap();

        let submissions = engine.submissions.lock().unwrap();
        let first = &submissions[0];
        assert_eq!(first.priority_of("validate"), Priority::Medium);
        assert_eq!(first.priority_of("charge"), Priority::Low);
        assert_eq!(first.admission.concurrency[0].group_key, "acme");
        assert_eq!(first.admission.rate_limits[0].bucket_key, "acme");

        let second = &submissions[1];
        assert_eq!(second.priority_of("validate"), Priority::High);
        assert_eq!(second.priority_of("charge"), Priority::High);
    }

    #[tokio::test]
    async fn run_rejects_bad_input_before_submission() {
        let engine = StubEngine::default();
        let worker = worker(engine.clone());
        worker
            .register_workflow(order_workflow(Arc::default()))
            .await
            .unwrap();

        let err = worker
            .run("orders", json!({ "region": "eu" }), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidInput { .. }));
        assert!(matches!(
            worker.run("missing", json!({}), RunOptions::default()).await,
            Err(WorkerError::UnknownWorkflow(_))
        ));
        assert!(engine.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = worker(StubEngine::default());
        worker.register_workflow(order_workflow(calls.clone())).await.unwrap();

        let report = worker
            .execute_assignment(assignment("validate", 0, json!({ "tenant": "acme" })))
            .await;
        match report.outcome {
            TaskOutcome::Failed { error, retry_in } => {
                assert_eq!(error.kind, FailureKind::Transient);
                assert_eq!(retry_in, Some(Duration::from_secs(1)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let report = worker
            .execute_assignment(assignment("validate", 1, json!({ "tenant": "acme" })))
            .await;
        assert_eq!(
            report.outcome,
            TaskOutcome::Completed {
                output: json!({ "tenant": "acme" })
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_gives_up_immediately() {
        let worker = worker(StubEngine::default());
        worker.register_workflow(order_workflow(Arc::default())).await.unwrap();

        let report = worker
            .execute_assignment(assignment("charge", 0, json!({ "tenant": "acme" })))
            .await;
        match report.outcome {
            TaskOutcome::Failed { error, retry_in } => {
                assert_eq!(error.kind, FailureKind::NonRetryable);
                assert_eq!(error.message, "card declined");
                assert_eq!(retry_in, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_input_never_invokes_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = worker(StubEngine::default());
        worker.register_workflow(order_workflow(calls.clone())).await.unwrap();

        let report = worker
            .execute_assignment(assignment("validate", 0, json!({ "nope": true })))
            .await;
        assert!(matches!(
            report.outcome,
            TaskOutcome::Failed { ref error, retry_in: None } if error.kind == FailureKind::Validation
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execution_timeout_is_terminal() {
        let worker = worker(StubEngine::default());
        worker.register_workflow(order_workflow(Arc::default())).await.unwrap();

        let report = worker
            .execute_assignment(assignment("slow", 0, json!({})))
            .await;
        assert!(matches!(
            report.outcome,
            TaskOutcome::Failed { ref error, retry_in: None } if error.kind == FailureKind::Timeout
        ));
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled() {
        let worker = worker(StubEngine::default());
        worker.register_workflow(order_workflow(Arc::default())).await.unwrap();

        let a = assignment("slow", 0, json!({}));
        a.cancellation.cancel();
        let report = worker.execute_assignment(a).await;
        assert_eq!(report.outcome, TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn unknown_task_fails_without_retry() {
        let worker = worker(StubEngine::default());
        let report = worker
            .execute_assignment(assignment("ghost", 0, json!({})))
            .await;
        assert!(matches!(
            report.outcome,
            TaskOutcome::Failed { ref error, retry_in: None } if error.kind == FailureKind::NonRetryable
        ));
    }

    #[tokio::test]
    async fn namespace_prefixes_workflow_names() {
        let engine = StubEngine::default();
        let mut config = WorkerConfig::named("test");
        config.namespace = Some("staging-".into());
        let worker = Worker::new(config, engine.clone(), BoxDurableLogRepository::new(NullRepo));
        worker.register_workflow(order_workflow(Arc::default())).await.unwrap();

        assert_eq!(worker.workflow_names(), vec!["staging-orders".to_string()]);
        assert_eq!(engine.registered.lock().unwrap()[0].name, "staging-orders");
        worker
            .run("orders", json!({ "tenant": "t" }), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.submissions.lock().unwrap()[0].workflow, "staging-orders");
    }
}
