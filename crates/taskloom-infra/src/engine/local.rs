//! In-process engine.
//!
//! `LocalEngine` implements both engine ports against in-memory state. It
//! admits runs through their concurrency groups, walks the DAG, evaluates
//! start gates, meters rate-limit buckets, schedules retries, resolves
//! durable suspensions and triggers workflows from pushed events.
//!
//! All bookkeeping happens synchronously under one mutex in [`LocalEngine::tick`].
//! Every port call ends with a tick; a background driver spawned on first
//! use ticks periodically so that time-based work (sleeps, retry delays,
//! rate-limit windows, schedule timeouts) progresses on its own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use taskloom_core::clock::{SharedClock, SystemClock};
use taskloom_core::engine::{
    EngineError, RunHandle, SuspensionBroker, SuspensionRequest, SuspensionTicket, TaskAssignment,
    WorkflowEngine,
};
use taskloom_core::workflow::admission::{AdmissionResolver, RateLimitRegistry};
use taskloom_core::workflow::condition::{ConditionEvaluator, GateDecision, ReceivedEvent};
use taskloom_core::workflow::dag::topological_order;
use taskloom_core::workflow::definition::validate_spec;
use taskloom_core::workflow::priority::resolve_task_priority;
use taskloom_types::condition::Condition;
use taskloom_types::durable::SuspendOutcome;
use taskloom_types::run::{
    ConcurrencyScope, FailureKind, ResolvedConcurrency, ResolvedRateLimit, RunResult, RunStatus,
    RunSubmission, TaskFailure, TaskOutcome, TaskReport, TaskRunRecord, TaskRunStatus,
};
use taskloom_types::workflow::{Priority, StaticRateLimit, TaskSpec, WorkflowSpec};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::slots::{
    Admission, BucketRequest, ConcurrencyGroups, Consumption, GroupRequest, Member, RateBuckets,
};

/// Default period of the background driver.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on progress passes within one tick.
const MAX_PASSES: usize = 8;

// ---------------------------------------------------------------------------
// LocalEngine
// ---------------------------------------------------------------------------

/// In-process engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<Inner>,
}

struct Inner {
    clock: SharedClock,
    tick_interval: Duration,
    driver_started: AtomicBool,
    state: Mutex<EngineState>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_options(clock, DEFAULT_TICK_INTERVAL)
    }

    pub fn with_options(clock: SharedClock, tick_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                tick_interval,
                driver_started: AtomicBool::new(false),
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Run one round of bookkeeping: resolve suspensions, admit queued
    /// runs, advance every active run and dispatch ready tasks.
    pub fn tick(&self) {
        // Not Send: must stay inside this synchronous call.
        let evaluator = ConditionEvaluator::new();
        let now = self.inner.clock.now();
        let mut state = self.state();

        state.resolve_suspensions(&evaluator, now);
        for _ in 0..MAX_PASSES {
            let mut changed = state.admit_queued_runs();
            for run_id in state.run_order.clone() {
                changed |= state.advance_run(run_id, &evaluator, now);
            }
            changed |= state.dispatch(now);
            if !changed {
                break;
            }
        }
        state.prune(now);
    }

    /// Current status of a run, if the engine knows it.
    pub fn run_status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.state().runs.get(&run_id).map(|r| r.status)
    }

    /// Current status of one task of a run.
    pub fn task_status(&self, run_id: Uuid, task: &str) -> Option<TaskRunStatus> {
        self.state()
            .runs
            .get(&run_id)
            .and_then(|r| r.tasks.get(task))
            .map(|t| t.status)
    }

    /// Number of suspension points ever registered.
    pub fn suspension_count(&self) -> usize {
        self.state().registered_suspensions
    }

    /// Suspension points still held, resolved or not. Dropped once their
    /// run finishes.
    pub fn retained_suspension_count(&self) -> usize {
        self.state().suspensions.len()
    }

    /// Pushed events still kept for gates and suspensions to match against.
    pub fn retained_event_count(&self) -> usize {
        self.state().events.len()
    }

    pub fn workflow(&self, name: &str) -> Option<WorkflowSpec> {
        self.state().workflows.get(name).cloned()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Spawn the periodic driver once. Must be called inside a runtime.
    fn ensure_driver(&self) {
        if self.inner.driver_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                LocalEngine { inner }.tick();
            }
            tracing::debug!("local engine driver stopped");
        });
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LocalEngine")
            .field("workflows", &state.workflows.len())
            .field("active_runs", &state.run_order.len())
            .field("suspensions", &state.suspensions.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Port implementations
// ---------------------------------------------------------------------------

impl WorkflowEngine for LocalEngine {
    async fn register_workflow(&self, spec: &WorkflowSpec) -> Result<(), EngineError> {
        validate_spec(spec).map_err(|e| EngineError::Rejected(e.to_string()))?;
        self.state().workflows.insert(spec.name.clone(), spec.clone());
        tracing::debug!(workflow = %spec.name, "workflow registered with local engine");
        Ok(())
    }

    async fn put_rate_limit(&self, limit: &StaticRateLimit) -> Result<(), EngineError> {
        let now = self.now();
        {
            let mut state = self.state();
            state
                .buckets
                .configure(&limit.key, limit.limit, window_of(limit.duration.as_duration()), now);
            state.rate_limits.put(limit.clone());
        }
        self.tick();
        Ok(())
    }

    async fn submit_run(&self, submission: RunSubmission) -> Result<RunHandle, EngineError> {
        self.ensure_driver();
        let now = self.now();
        let handle = self.state().submit(submission, now)?;
        self.tick();
        Ok(handle)
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        {
            let mut state = self.state();
            if !state.runs.contains_key(&run_id) {
                return Err(EngineError::UnknownRun(run_id));
            }
            tracing::info!(run_id = %run_id, "run cancelled");
            state.cancel_run(run_id);
        }
        self.tick();
        Ok(())
    }

    async fn push_event(&self, key: &str, payload: Value) -> Result<(), EngineError> {
        self.ensure_driver();
        let now = self.now();
        {
            let mut state = self.state();
            state
                .events
                .push(ReceivedEvent::new(key, payload.clone(), now));
            state.trigger_from_event(key, &payload, now);
        }
        self.tick();
        Ok(())
    }

    async fn listen(&self, worker: &str) -> Result<mpsc::UnboundedReceiver<TaskAssignment>, EngineError> {
        self.ensure_driver();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            let mut backlog = std::mem::take(&mut state.backlog);
            // Stable: equal priorities keep dispatch order.
            backlog.sort_by(|a, b| b.priority.cmp(&a.priority));
            for assignment in backlog {
                if assignment.cancellation.is_cancelled() {
                    continue;
                }
                if let Err(mpsc::error::SendError(assignment)) = tx.send(assignment) {
                    state.backlog.push(assignment);
                }
            }
            state.listeners.push(Listener {
                worker: worker.to_string(),
                sender: tx,
            });
        }
        tracing::info!(worker, "worker listening");
        self.tick();
        Ok(rx)
    }

    async fn report(&self, report: TaskReport) -> Result<(), EngineError> {
        let now = self.now();
        self.state().apply_report(report, now)?;
        self.tick();
        Ok(())
    }
}

impl SuspensionBroker for LocalEngine {
    async fn register_suspension(
        &self,
        request: SuspensionRequest,
    ) -> Result<SuspensionTicket, EngineError> {
        self.ensure_driver();
        let now = self.now();
        let ticket = {
            let mut state = self.state();
            let key = (request.task_instance_id, request.sequence);
            match state.suspensions.get(&key) {
                Some(existing) if existing.fingerprint == request.fingerprint => SuspensionTicket {
                    anchored_at: existing.anchored_at,
                },
                Some(_) => {
                    return Err(EngineError::SuspensionConflict {
                        instance: request.task_instance_id,
                        sequence: request.sequence,
                    });
                }
                None => {
                    let (outcome, _) = watch::channel(None);
                    state.registered_suspensions += 1;
                    state.suspensions.insert(
                        key,
                        Suspension {
                            condition: request.condition,
                            fingerprint: request.fingerprint,
                            anchored_at: now,
                            outcome,
                        },
                    );
                    tracing::debug!(
                        instance = %request.task_instance_id,
                        sequence = request.sequence,
                        "suspension registered"
                    );
                    SuspensionTicket { anchored_at: now }
                }
            }
        };
        self.tick();
        Ok(ticket)
    }

    async fn await_resolution(
        &self,
        task_instance_id: Uuid,
        sequence: u64,
    ) -> Result<SuspendOutcome, EngineError> {
        let mut receiver = {
            let state = self.state();
            state
                .suspensions
                .get(&(task_instance_id, sequence))
                .map(|s| s.outcome.subscribe())
                .ok_or(EngineError::UnknownSuspension {
                    instance: task_instance_id,
                    sequence,
                })?
        };
        let resolved = receiver
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| EngineError::Closed)?;
        (*resolved).clone().ok_or(EngineError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct Listener {
    worker: String,
    sender: mpsc::UnboundedSender<TaskAssignment>,
}

struct Suspension {
    condition: Condition,
    fingerprint: String,
    anchored_at: DateTime<Utc>,
    outcome: watch::Sender<Option<SuspendOutcome>>,
}

struct TaskState {
    spec: TaskSpec,
    instance_id: Uuid,
    status: TaskRunStatus,
    attempts: u32,
    /// When the parents finished; anchors gates and the schedule timeout.
    ready_at: Option<DateTime<Utc>>,
    /// Earliest time of the next attempt (retry delay, rate-limit window).
    not_before: Option<DateTime<Utc>>,
    /// Holds slots in its task-scoped concurrency groups.
    holds_slot: bool,
    gate_payload: Value,
    output: Option<Value>,
    error: Option<TaskFailure>,
    cancellation: CancellationToken,
    terminal_handler: bool,
}

impl TaskState {
    fn new(spec: TaskSpec, terminal_handler: bool) -> Self {
        Self {
            spec,
            instance_id: Uuid::now_v7(),
            status: TaskRunStatus::Pending,
            attempts: 0,
            ready_at: None,
            not_before: None,
            holds_slot: false,
            gate_payload: Value::Object(Map::new()),
            output: None,
            error: None,
            cancellation: CancellationToken::new(),
            terminal_handler,
        }
    }

    fn cancel(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.cancellation.cancel();
        self.status = TaskRunStatus::Cancelled;
        self.error = Some(TaskFailure {
            kind: FailureKind::Cancelled,
            message: reason.to_string(),
        });
    }

    fn record(&self) -> TaskRunRecord {
        TaskRunRecord {
            status: self.status,
            attempts: self.attempts,
            output: self.output.clone(),
            error: self.error.clone(),
        }
    }

    fn schedule_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ready_at) = self.ready_at else {
            return false;
        };
        self.attempts == 0 && now - ready_at > window_of(self.spec.schedule_timeout)
    }
}

struct RunState {
    submission: RunSubmission,
    spec: WorkflowSpec,
    status: RunStatus,
    tasks: BTreeMap<String, TaskState>,
    /// DAG tasks in topological order, then any scheduled terminal handler.
    order: Vec<String>,
    /// Decided once the DAG is done; a terminal handler may still be running.
    outcome: Option<RunStatus>,
    error: Option<TaskFailure>,
    result: watch::Sender<Option<RunResult>>,
}

impl RunState {
    fn dag_tasks(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks.values().filter(|t| !t.terminal_handler)
    }
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<String, WorkflowSpec>,
    rate_limits: RateLimitRegistry,
    groups: ConcurrencyGroups,
    buckets: RateBuckets,
    runs: HashMap<Uuid, RunState>,
    /// Non-terminal runs in submission order.
    run_order: Vec<Uuid>,
    /// Events not older than the earliest anchor still waiting on them.
    events: Vec<ReceivedEvent>,
    /// Keyed by (task instance, sequence); kept until the owning run ends.
    suspensions: HashMap<(Uuid, u64), Suspension>,
    registered_suspensions: usize,
    listeners: Vec<Listener>,
    next_listener: usize,
    /// Assignments dispatched while no worker was listening.
    backlog: Vec<TaskAssignment>,
}

impl EngineState {
    // -- submission and admission ------------------------------------------

    fn submit(&mut self, submission: RunSubmission, now: DateTime<Utc>) -> Result<RunHandle, EngineError> {
        let spec = self
            .workflows
            .get(&submission.workflow)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(submission.workflow.clone()))?;

        for limit in &submission.admission.rate_limits {
            if limit.limit.is_none() && !self.rate_limits.contains(&limit.bucket_key) {
                return Err(EngineError::UnknownRateLimit(limit.bucket_key.clone()));
            }
        }
        if self.runs.contains_key(&submission.run_id) {
            return Err(EngineError::Rejected(format!(
                "run {} already exists",
                submission.run_id
            )));
        }

        let order: Vec<String> = topological_order(&spec.tasks)
            .map_err(|e| EngineError::Rejected(e.to_string()))?
            .into_iter()
            .map(|i| spec.tasks[i].name.clone())
            .collect();
        let tasks = spec
            .tasks
            .iter()
            .map(|t| (t.name.clone(), TaskState::new(t.clone(), false)))
            .collect();

        let run_id = submission.run_id;
        let (result, receiver) = watch::channel(None);
        tracing::info!(run_id = %run_id, workflow = %spec.name, "run accepted");
        self.runs.insert(
            run_id,
            RunState {
                submission,
                spec,
                status: RunStatus::Queued,
                tasks,
                order,
                outcome: None,
                error: None,
                result,
            },
        );
        self.run_order.push(run_id);
        self.admit_run(run_id);
        Ok(RunHandle::new(run_id, receiver))
    }

    /// Build and submit a run for every workflow triggered by `key`.
    fn trigger_from_event(&mut self, key: &str, payload: &Value, now: DateTime<Utc>) {
        let triggered: Vec<WorkflowSpec> = self
            .workflows
            .values()
            .filter(|w| w.triggers.events.iter().any(|k| k == key))
            .cloned()
            .collect();
        if triggered.is_empty() {
            return;
        }

        let resolver = AdmissionResolver::new();
        for spec in triggered {
            let metadata = Map::new();
            let admission = match resolver.resolve(&spec, payload, &metadata, &self.rate_limits) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(workflow = %spec.name, key, error = %e, "event trigger rejected");
                    continue;
                }
            };
            let task_priorities = spec
                .tasks
                .iter()
                .chain(spec.on_failure.iter())
                .chain(spec.on_success.iter())
                .map(|t| (t.name.clone(), resolve_task_priority(None, t, &spec)))
                .collect();
            let submission = RunSubmission {
                run_id: Uuid::now_v7(),
                workflow: spec.name.clone(),
                input: payload.clone(),
                additional_metadata: metadata,
                priority_override: None,
                task_priorities,
                admission,
                submitted_at: now,
            };
            match self.submit(submission, now) {
                Ok(handle) => {
                    tracing::info!(run_id = %handle.run_id, workflow = %spec.name, key, "run triggered by event");
                }
                Err(e) => {
                    tracing::warn!(workflow = %spec.name, key, error = %e, "event trigger rejected");
                }
            }
        }
    }

    fn admit_run(&mut self, run_id: Uuid) -> bool {
        let Some(run) = self.runs.get(&run_id) else {
            return false;
        };
        if run.status != RunStatus::Queued {
            return false;
        }
        let requests: Vec<GroupRequest> = run
            .submission
            .admission
            .workflow_concurrency()
            .map(|c| group_request(&run.submission.workflow, c))
            .collect();

        match self.groups.try_admit(&Member::Run(run_id), &requests) {
            Admission::Admitted { preempted } => {
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.status = RunStatus::Running;
                }
                tracing::debug!(run_id = %run_id, "run admitted");
                self.preempt_all(preempted);
                true
            }
            Admission::Queued => false,
            Admission::Rejected => {
                tracing::info!(run_id = %run_id, "run rejected by concurrency limit");
                self.cancel_run(run_id);
                true
            }
        }
    }

    fn admit_queued_runs(&mut self) -> bool {
        let mut changed = false;
        for run_id in self.run_order.clone() {
            changed |= self.admit_run(run_id);
        }
        changed
    }

    fn preempt(&mut self, member: Member) {
        match &member {
            Member::Run(run_id) => {
                tracing::info!(run_id = %run_id, "run preempted by a newer run");
                self.cancel_run(*run_id);
            }
            Member::Task(run_id, task) => {
                tracing::info!(run_id = %run_id, task = %task, "task preempted by a newer run");
                if let Some(state) = self.runs.get_mut(run_id).and_then(|r| r.tasks.get_mut(task)) {
                    state.cancel("preempted by a newer run");
                    state.holds_slot = false;
                }
                self.groups.release(&member);
                self.backlog
                    .retain(|a| !(a.run_id == *run_id && a.task == *task));
            }
        }
    }

    // -- run progression ---------------------------------------------------

    fn advance_run(&mut self, run_id: Uuid, evaluator: &ConditionEvaluator, now: DateTime<Utc>) -> bool {
        let EngineState {
            runs,
            groups,
            events,
            ..
        } = &mut *self;
        let Some(run) = runs.get_mut(&run_id) else {
            return false;
        };
        if run.status != RunStatus::Running {
            return false;
        }

        let mut changed = progress_tasks(run, events, evaluator, now);

        if run.outcome.is_none() {
            let failed = run
                .order
                .iter()
                .filter_map(|name| run.tasks.get(name))
                .find(|t| matches!(t.status, TaskRunStatus::Failed | TaskRunStatus::TimedOut))
                .map(|t| t.error.clone());

            let outcome = match failed {
                Some(error) => {
                    run.error = error;
                    for task in run.tasks.values_mut() {
                        task.cancel("run failed");
                    }
                    Some(RunStatus::Failed)
                }
                None if run.dag_tasks().all(|t| t.status.is_terminal()) => {
                    if run.dag_tasks().any(|t| t.status == TaskRunStatus::Cancelled) {
                        Some(RunStatus::Cancelled)
                    } else {
                        Some(RunStatus::Completed)
                    }
                }
                None => None,
            };

            if let Some(outcome) = outcome {
                tracing::debug!(run_id = %run_id, outcome = ?outcome, "task graph finished");
                run.outcome = Some(outcome);
                let handler = match outcome {
                    RunStatus::Failed => run.spec.on_failure.clone(),
                    RunStatus::Completed => run.spec.on_success.clone(),
                    _ => None,
                };
                if let Some(spec) = handler {
                    let name = spec.name.clone();
                    let mut task = TaskState::new(spec, true);
                    task.status = TaskRunStatus::Queued;
                    task.ready_at = Some(now);
                    run.tasks.insert(name.clone(), task);
                    run.order.push(name);
                }
                changed = true;
            }
        }

        for (name, task) in run.tasks.iter_mut() {
            if task.holds_slot && task.status.is_terminal() {
                groups.release(&Member::Task(run_id, name.clone()));
                task.holds_slot = false;
            }
        }

        if let Some(outcome) = run.outcome {
            let handlers_done = run
                .tasks
                .values()
                .filter(|t| t.terminal_handler)
                .all(|t| t.status.is_terminal());
            if handlers_done {
                let handler_failure = run
                    .tasks
                    .values()
                    .filter(|t| t.terminal_handler && outcome == RunStatus::Completed)
                    .find(|t| t.status != TaskRunStatus::Completed)
                    .map(|t| t.error.clone());
                let status = match handler_failure {
                    Some(error) => {
                        run.error = error;
                        RunStatus::Failed
                    }
                    None => outcome,
                };
                self.finalize(run_id, status);
                changed = true;
            }
        }
        changed
    }

    fn cancel_run(&mut self, run_id: Uuid) {
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        for task in run.tasks.values_mut() {
            task.cancel("run cancelled");
        }
        run.outcome = Some(RunStatus::Cancelled);
        self.finalize(run_id, RunStatus::Cancelled);
    }

    fn finalize(&mut self, run_id: Uuid, status: RunStatus) {
        self.groups.release_run(run_id);
        self.backlog.retain(|a| a.run_id != run_id);
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };
        // No attempt of this run can replay against the engine any more.
        let instances: HashSet<Uuid> = run.tasks.values().map(|t| t.instance_id).collect();
        self.suspensions
            .retain(|(instance, _), _| !instances.contains(instance));
        for task in run.tasks.values_mut() {
            task.holds_slot = false;
        }
        run.status = status;
        let result = RunResult {
            run_id,
            workflow: run.spec.name.clone(),
            status,
            tasks: run
                .tasks
                .iter()
                .map(|(name, task)| (name.clone(), task.record()))
                .collect(),
            error: if status == RunStatus::Completed {
                None
            } else {
                run.error.clone()
            },
        };
        run.result.send_replace(Some(result));
        tracing::info!(run_id = %run_id, workflow = %run.spec.name, status = ?status, "run finished");
    }

    /// Forget terminal runs in the active list (their results stay
    /// queryable) and drop events nothing can match any more.
    fn prune(&mut self, now: DateTime<Utc>) {
        let runs = &self.runs;
        self.run_order
            .retain(|id| runs.get(id).is_some_and(|r| !r.status.is_terminal()));

        // Matching ignores events received before the anchor, and anything
        // that starts waiting later anchors at or after `now`.
        let pending_suspensions = self
            .suspensions
            .values()
            .filter(|s| s.outcome.borrow().is_none())
            .map(|s| s.anchored_at);
        let waiting_gates = self
            .run_order
            .iter()
            .filter_map(|id| runs.get(id))
            .flat_map(|run| run.tasks.values())
            .filter(|t| t.status == TaskRunStatus::Waiting)
            .filter_map(|t| t.ready_at);
        let cutoff = pending_suspensions
            .chain(waiting_gates)
            .fold(now, |cutoff, anchor| cutoff.min(anchor));

        let before = self.events.len();
        self.events.retain(|e| e.received_at >= cutoff);
        if self.events.len() < before {
            tracing::trace!(dropped = before - self.events.len(), "pruned events");
        }
    }

    // -- dispatch ------------------------------------------------------------

    /// Start every queued task whose delay has passed, highest priority first.
    fn dispatch(&mut self, now: DateTime<Utc>) -> bool {
        let mut candidates: Vec<(Priority, usize, Uuid, String)> = Vec::new();
        for (position, run_id) in self.run_order.iter().enumerate() {
            let Some(run) = self.runs.get(run_id) else {
                continue;
            };
            if run.status != RunStatus::Running {
                continue;
            }
            for name in &run.order {
                let Some(task) = run.tasks.get(name) else {
                    continue;
                };
                if task.status == TaskRunStatus::Queued && task.not_before.is_none_or(|t| t <= now) {
                    candidates.push((run.submission.priority_of(name), position, *run_id, name.clone()));
                }
            }
        }
        // Stable: within a priority, submission order then task order.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut changed = false;
        for (_, _, run_id, name) in candidates {
            changed |= self.try_start(run_id, &name, now);
        }
        changed
    }

    fn try_start(&mut self, run_id: Uuid, name: &str, now: DateTime<Utc>) -> bool {
        let EngineState {
            runs,
            groups,
            buckets,
            rate_limits,
            ..
        } = &mut *self;
        let Some(run) = runs.get_mut(&run_id) else {
            return false;
        };
        if run.status != RunStatus::Running {
            return false;
        }
        let RunState {
            submission, tasks, ..
        } = run;

        let parent_outputs = match tasks.get(name) {
            Some(task) if task.terminal_handler => completed_outputs(tasks, |t| !t.terminal_handler),
            Some(task) => {
                let parents = task.spec.parents.clone();
                completed_outputs(tasks, |t| parents.contains(&t.spec.name))
            }
            None => return false,
        };
        let Some(task) = tasks.get_mut(name) else {
            return false;
        };
        if task.status != TaskRunStatus::Queued {
            return false;
        }

        let mut preempted = Vec::new();
        if !task.holds_slot {
            let requests: Vec<GroupRequest> = submission
                .admission
                .task_concurrency(name)
                .map(|c| group_request(&submission.workflow, c))
                .collect();
            if !requests.is_empty() {
                match groups.try_admit(&Member::Task(run_id, name.to_string()), &requests) {
                    Admission::Admitted { preempted: lost } => {
                        task.holds_slot = true;
                        preempted = lost;
                    }
                    Admission::Queued => return false,
                    Admission::Rejected => {
                        tracing::info!(run_id = %run_id, task = name, "task rejected by concurrency limit");
                        task.cancel("concurrency limit reached");
                        return true;
                    }
                }
            }
        }

        let requests: Vec<BucketRequest> = submission
            .admission
            .task_rate_limits(name)
            .filter_map(|r| bucket_request(r, rate_limits))
            .collect();
        match buckets.try_consume(&requests, now) {
            Consumption::Granted => {}
            Consumption::Exhausted { retry_at } => {
                tracing::debug!(run_id = %run_id, task = name, %retry_at, "rate limit exhausted");
                task.not_before = Some(retry_at);
                self.preempt_all(preempted);
                return false;
            }
            Consumption::Impossible { key } => {
                task.status = TaskRunStatus::Failed;
                task.error = Some(TaskFailure {
                    kind: FailureKind::NonRetryable,
                    message: format!("rate limit '{key}' can never grant the requested units"),
                });
                self.preempt_all(preempted);
                return true;
            }
        }

        task.attempts += 1;
        task.status = TaskRunStatus::Running;
        task.not_before = None;
        task.cancellation = CancellationToken::new();
        let assignment = TaskAssignment {
            run_id,
            workflow: submission.workflow.clone(),
            task: name.to_string(),
            task_instance_id: task.instance_id,
            retry_count: task.attempts - 1,
            priority: submission.priority_of(name),
            input: submission.input.clone(),
            additional_metadata: submission.additional_metadata.clone(),
            parent_outputs,
            gate_payload: task.gate_payload.clone(),
            cancellation: task.cancellation.clone(),
        };
        tracing::debug!(
            run_id = %run_id,
            task = name,
            retry_count = assignment.retry_count,
            priority = ?assignment.priority,
            "task dispatched"
        );

        self.preempt_all(preempted);
        self.deliver(assignment);
        true
    }

    fn preempt_all(&mut self, members: Vec<Member>) {
        for member in members {
            self.preempt(member);
        }
    }

    /// Hand an assignment to the next live listener, round-robin.
    fn deliver(&mut self, mut assignment: TaskAssignment) {
        while !self.listeners.is_empty() {
            let index = self.next_listener % self.listeners.len();
            match self.listeners[index].sender.send(assignment) {
                Ok(()) => {
                    self.next_listener = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    let gone = self.listeners.remove(index);
                    tracing::warn!(worker = %gone.worker, "worker stopped listening");
                    assignment = returned;
                }
            }
        }
        self.backlog.push(assignment);
    }

    // -- reports -------------------------------------------------------------

    fn apply_report(&mut self, report: TaskReport, now: DateTime<Utc>) -> Result<(), EngineError> {
        let run = self
            .runs
            .get_mut(&report.run_id)
            .ok_or(EngineError::UnknownRun(report.run_id))?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %report.run_id, task = %report.task, "report for finished run ignored");
            return Ok(());
        }
        let task = run.tasks.get_mut(&report.task).ok_or_else(|| {
            EngineError::Rejected(format!("run {} has no task '{}'", report.run_id, report.task))
        })?;
        if task.status != TaskRunStatus::Running || task.attempts != report.retry_count + 1 {
            tracing::debug!(
                run_id = %report.run_id,
                task = %report.task,
                retry_count = report.retry_count,
                "stale report ignored"
            );
            return Ok(());
        }

        match report.outcome {
            TaskOutcome::Completed { output } => {
                task.status = TaskRunStatus::Completed;
                task.output = Some(output);
                task.error = None;
            }
            TaskOutcome::Failed {
                error,
                retry_in: Some(delay),
            } => {
                tracing::debug!(run_id = %report.run_id, task = %report.task, ?delay, "retry scheduled");
                task.status = TaskRunStatus::Queued;
                task.not_before = Some(now + window_of(delay));
                task.error = Some(error);
            }
            TaskOutcome::Failed {
                error,
                retry_in: None,
            } => {
                task.status = if error.kind == FailureKind::Timeout {
                    TaskRunStatus::TimedOut
                } else {
                    TaskRunStatus::Failed
                };
                task.error = Some(error);
            }
            TaskOutcome::Cancelled => {
                task.status = TaskRunStatus::Cancelled;
                task.error.get_or_insert(TaskFailure {
                    kind: FailureKind::Cancelled,
                    message: "cancelled by worker".to_string(),
                });
            }
        }
        Ok(())
    }

    // -- suspensions ---------------------------------------------------------

    fn resolve_suspensions(&mut self, evaluator: &ConditionEvaluator, now: DateTime<Utc>) {
        for ((instance, sequence), suspension) in &self.suspensions {
            if suspension.outcome.borrow().is_some() {
                continue;
            }
            match evaluator.evaluate(&suspension.condition, suspension.anchored_at, now, &self.events) {
                Ok(eval) if eval.satisfied => {
                    tracing::debug!(instance = %instance, sequence, "suspension resolved");
                    suspension.outcome.send_replace(Some(SuspendOutcome {
                        resolved_at: eval.satisfied_at.unwrap_or(now),
                        payload: eval.payload,
                    }));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(instance = %instance, sequence, error = %e, "suspension evaluation failed");
                }
            }
        }
    }
}

/// Move tasks of one run forward: unblock children, evaluate gates and
/// enforce schedule timeouts.
fn progress_tasks(
    run: &mut RunState,
    events: &[ReceivedEvent],
    evaluator: &ConditionEvaluator,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;

    // Cancellation cascades through several generations.
    loop {
        let mut pass = false;
        for name in run.order.clone() {
            let Some(task) = run.tasks.get(&name) else {
                continue;
            };
            if task.status != TaskRunStatus::Pending {
                continue;
            }
            let parents: Vec<TaskRunStatus> = task
                .spec
                .parents
                .iter()
                .filter_map(|p| run.tasks.get(p).map(|t| t.status))
                .collect();
            let Some(task) = run.tasks.get_mut(&name) else {
                continue;
            };
            if parents.iter().any(|s| s.is_terminal() && !s.unblocks_children()) {
                task.cancel("parent did not complete");
                pass = true;
            } else if parents.iter().all(|s| s.unblocks_children()) {
                task.ready_at = Some(now);
                task.status = if task.spec.has_gates() {
                    TaskRunStatus::Waiting
                } else {
                    TaskRunStatus::Queued
                };
                tracing::debug!(task = %name, status = ?task.status, "task ready");
                pass = true;
            }
        }
        if !pass {
            break;
        }
        changed = true;
    }

    for (name, task) in run.tasks.iter_mut() {
        match task.status {
            TaskRunStatus::Waiting => {
                let anchor = task.ready_at.unwrap_or(now);
                match evaluator.evaluate_gate(&task.spec, anchor, now, events) {
                    Ok(GateDecision::Proceed { payload }) => {
                        task.gate_payload = payload;
                        task.status = TaskRunStatus::Queued;
                        changed = true;
                    }
                    Ok(GateDecision::Wait { .. }) => {
                        if task.schedule_expired(now) {
                            time_out(task);
                            changed = true;
                        }
                    }
                    Ok(GateDecision::Skip) => {
                        tracing::debug!(task = %name, "task skipped by gate");
                        task.status = TaskRunStatus::Skipped;
                        changed = true;
                    }
                    Ok(GateDecision::Cancel) => {
                        tracing::debug!(task = %name, "task cancelled by gate");
                        task.cancel("cancelled by gate condition");
                        changed = true;
                    }
                    Err(e) => {
                        task.status = TaskRunStatus::Failed;
                        task.error = Some(TaskFailure {
                            kind: FailureKind::Expression,
                            message: e.to_string(),
                        });
                        changed = true;
                    }
                }
            }
            TaskRunStatus::Queued if task.schedule_expired(now) => {
                time_out(task);
                changed = true;
            }
            _ => {}
        }
    }
    changed
}

fn time_out(task: &mut TaskState) {
    tracing::debug!(task = %task.spec.name, "task was not scheduled in time");
    task.status = TaskRunStatus::TimedOut;
    task.error = Some(TaskFailure {
        kind: FailureKind::Timeout,
        message: format!(
            "not scheduled within {}",
            taskloom_types::duration::format_duration(task.spec.schedule_timeout)
        ),
    });
}

fn completed_outputs(
    tasks: &BTreeMap<String, TaskState>,
    include: impl Fn(&TaskState) -> bool,
) -> BTreeMap<String, Value> {
    tasks
        .iter()
        .filter(|(_, t)| include(t) && t.status == TaskRunStatus::Completed)
        .filter_map(|(name, t)| t.output.clone().map(|o| (name.clone(), o)))
        .collect()
}

fn group_request(workflow: &str, entry: &ResolvedConcurrency) -> GroupRequest {
    let owner = match &entry.scope {
        ConcurrencyScope::Workflow => workflow.to_string(),
        ConcurrencyScope::Task(task) => format!("{workflow}.{task}"),
    };
    GroupRequest {
        key: format!("{owner}/{}/{}", entry.expression, entry.group_key),
        max_runs: entry.max_runs,
        strategy: entry.strategy,
    }
}

fn bucket_request(entry: &ResolvedRateLimit, registry: &RateLimitRegistry) -> Option<BucketRequest> {
    let (limit, duration) = match (entry.limit, entry.duration) {
        (Some(limit), duration) => (limit, duration.unwrap_or_default()),
        (None, _) => {
            let registered = registry.get(&entry.bucket_key)?;
            (registered.limit, registered.duration)
        }
    };
    Some(BucketRequest {
        key: entry.bucket_key.clone(),
        units: entry.units,
        limit,
        window: window_of(duration.as_duration()),
    })
}

/// Clamp to a century so date arithmetic stays in range.
fn window_of(duration: Duration) -> TimeDelta {
    let max = TimeDelta::days(36_500);
    TimeDelta::from_std(duration).map_or(max, |d| d.min(max))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
