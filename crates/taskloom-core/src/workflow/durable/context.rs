//! `DurableContext`: replay-safe `sleep_for` / `wait_for` for one durable
//! task instance.
//!
//! Each call is a suspension point with the next sequence number:
//!
//! 1. If the log already holds an entry at that sequence, its fingerprint
//!    must match the requested condition (`ReplayMismatch` otherwise).
//!    - A resolved entry short-circuits to the recorded outcome. The engine
//!      is not contacted.
//!    - An unresolved entry re-attaches to the original registration and
//!      waits only for what is left of its anchored deadline.
//! 2. Otherwise the condition is registered with the engine exactly once,
//!    the entry is persisted, and the instance suspends.
//!
//! Cancellation is observed while suspended; a cancelled instance moves to
//! CANCELLED instead of re-entering RUNNING. An attached `ExecutionBudget`
//! is paused for as long as the instance waits on the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskloom_types::condition::Condition;
use taskloom_types::durable::{DurableExecutionState, DurableStatus, SuspendLogEntry, SuspendOutcome};
use taskloom_types::event::WorkerEvent;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{DurableError, ExecutionBudget, ReplayLog};
use crate::clock::{SharedClock, remaining_until};
use crate::engine::{BoxSuspensionBroker, SuspensionRequest};
use crate::event::EventBus;
use crate::repository::BoxDurableLogRepository;
use crate::workflow::condition::{ConditionEvaluator, fingerprint, validate_condition};

/// What `sleep_for` observed.
#[derive(Debug, Clone, PartialEq)]
pub struct SleepResult {
    pub requested: Duration,
    /// Engine-anchored start of the sleep (from the first registration).
    pub anchored_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Time left when this call was entered. Equal to `requested` on a
    /// first pass; smaller after a restart; zero when replayed past.
    pub remaining_at_entry: Duration,
    /// The suspension point was already in the log.
    pub replayed: bool,
}

impl SleepResult {
    /// Portion of the sleep that had already elapsed on entry.
    pub fn elapsed_before_entry(&self) -> Duration {
        self.requested.saturating_sub(self.remaining_at_entry)
    }
}

struct SuspensionPoint {
    outcome: SuspendOutcome,
    anchored_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    remaining_at_entry: Duration,
    replayed: bool,
}

/// Event-bus attribution for a context.
#[derive(Clone)]
struct Reporter {
    bus: EventBus,
    run_id: Uuid,
    task: String,
}

pub struct DurableContext {
    log: ReplayLog,
    broker: BoxSuspensionBroker,
    repository: BoxDurableLogRepository,
    clock: SharedClock,
    cancellation: CancellationToken,
    reporter: Option<Reporter>,
    budget: Option<Arc<ExecutionBudget>>,
}

impl DurableContext {
    /// Open the context for `task_instance_id`, resuming persisted state if
    /// there is any.
    pub async fn open(
        task_instance_id: Uuid,
        broker: BoxSuspensionBroker,
        repository: BoxDurableLogRepository,
        clock: SharedClock,
        cancellation: CancellationToken,
    ) -> Result<Self, DurableError> {
        let log = match repository.load_state(&task_instance_id).await? {
            Some(state) => {
                tracing::debug!(
                    instance = %task_instance_id,
                    entries = state.suspend_log.len(),
                    status = %state.status,
                    "resuming durable state"
                );
                ReplayLog::resume(state)
            }
            None => ReplayLog::new(task_instance_id),
        };
        Ok(Self {
            log,
            broker,
            repository,
            clock,
            cancellation,
            reporter: None,
            budget: None,
        })
    }

    /// Publish suspend/resume events for `task` of `run_id` on `bus`.
    pub fn with_events(mut self, bus: EventBus, run_id: Uuid, task: impl Into<String>) -> Self {
        self.reporter = Some(Reporter {
            bus,
            run_id,
            task: task.into(),
        });
        self
    }

    /// Stop `budget` while suspended so waiting does not count as running.
    pub fn with_budget(mut self, budget: Arc<ExecutionBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn task_instance_id(&self) -> Uuid {
        self.log.state().task_instance_id
    }

    pub fn state(&self) -> &DurableExecutionState {
        self.log.state()
    }

    pub fn status(&self) -> DurableStatus {
        self.log.status()
    }

    /// Suspend for `duration` measured from the engine-anchored start.
    pub async fn sleep_for(&mut self, duration: Duration) -> Result<SleepResult, DurableError> {
        let point = self.suspend(Condition::sleep(duration)).await?;
        let deadline = point.deadline.unwrap_or_else(|| {
            chrono::Duration::from_std(duration)
                .ok()
                .and_then(|d| point.anchored_at.checked_add_signed(d))
                .unwrap_or(point.anchored_at)
        });
        Ok(SleepResult {
            requested: duration,
            anchored_at: point.anchored_at,
            deadline,
            remaining_at_entry: point.remaining_at_entry,
            replayed: point.replayed,
        })
    }

    /// Suspend until `condition` is satisfied.
    pub async fn wait_for(&mut self, condition: Condition) -> Result<SuspendOutcome, DurableError> {
        validate_condition(&condition).map_err(|e| DurableError::InvalidCondition(e.to_string()))?;
        Ok(self.suspend(condition).await?.outcome)
    }

    /// RUNNING -> COMPLETED.
    pub async fn complete(&mut self) -> Result<(), DurableError> {
        self.log.transition(DurableStatus::Completed)?;
        self.persist().await
    }

    /// RUNNING -> FAILED.
    pub async fn fail(&mut self) -> Result<(), DurableError> {
        self.log.transition(DurableStatus::Failed)?;
        self.persist().await
    }

    /// Any non-terminal state -> CANCELLED. No-op when already terminal.
    pub async fn cancel(&mut self) -> Result<(), DurableError> {
        if self.log.status().is_terminal() {
            return Ok(());
        }
        self.log.transition(DurableStatus::Cancelled)?;
        self.persist().await
    }

    /// Persist the current state so the next attempt replays from it.
    pub async fn checkpoint(&self) -> Result<(), DurableError> {
        self.persist().await
    }

    async fn suspend(&mut self, condition: Condition) -> Result<SuspensionPoint, DurableError> {
        self.ensure_live().await?;

        let canonical = condition.canonicalize();
        let requested = fingerprint(&canonical);
        let sequence = self.log.advance();
        let instance = self.task_instance_id();

        let (anchored_at, deadline, replayed) = match self.log.entry(sequence) {
            Some(entry) => {
                if entry.fingerprint != requested {
                    return Err(DurableError::ReplayMismatch {
                        sequence,
                        recorded: entry.fingerprint.clone(),
                        requested,
                    });
                }
                if let Some(outcome) = entry.outcome.clone() {
                    let anchored_at = entry.anchored_at;
                    let deadline = entry.deadline;
                    tracing::debug!(%instance, sequence, "replaying resolved suspension");
                    self.settle(sequence).await?;
                    self.emit_resumed(sequence, true);
                    return Ok(SuspensionPoint {
                        outcome,
                        anchored_at,
                        deadline,
                        remaining_at_entry: Duration::ZERO,
                        replayed: true,
                    });
                }
                tracing::debug!(%instance, sequence, "re-attaching to pending suspension");
                (entry.anchored_at, entry.deadline, true)
            }
            None => {
                let ticket = self
                    .broker
                    .register_suspension(SuspensionRequest {
                        task_instance_id: instance,
                        sequence,
                        condition: canonical.clone(),
                        fingerprint: requested.clone(),
                    })
                    .await?;
                let deadline = initial_deadline(&canonical, ticket.anchored_at);
                self.log.append(SuspendLogEntry {
                    sequence,
                    condition: canonical,
                    fingerprint: requested,
                    anchored_at: ticket.anchored_at,
                    deadline,
                    outcome: None,
                })?;
                tracing::debug!(%instance, sequence, "registered suspension");
                (ticket.anchored_at, deadline, false)
            }
        };

        let remaining_at_entry = deadline
            .map(|d| remaining_until(self.clock.as_ref(), d))
            .unwrap_or(Duration::ZERO);

        let suspended = DurableStatus::Suspended { sequence };
        if self.log.status() != suspended {
            self.log.transition(suspended)?;
        }
        self.persist().await?;
        self.emit(|run_id, task| WorkerEvent::TaskSuspended {
            run_id,
            task,
            sequence,
        });

        let cancellation = self.cancellation.clone();
        let broker = self.broker.clone();
        let budget = self.budget.clone();
        let resolved = {
            let _paused = budget.as_deref().map(ExecutionBudget::paused);
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                resolved = broker.await_resolution(instance, sequence) => Some(resolved),
            }
        };
        let outcome = match resolved {
            Some(resolved) => resolved?,
            None => {
                tracing::debug!(%instance, sequence, "cancelled while suspended");
                self.cancel().await?;
                return Err(DurableError::Cancelled);
            }
        };

        self.log.record_outcome(sequence, outcome.clone())?;
        self.settle(sequence).await?;
        self.emit_resumed(sequence, replayed);

        Ok(SuspensionPoint {
            outcome,
            anchored_at,
            deadline,
            remaining_at_entry,
            replayed,
        })
    }

    /// Bring a SUSPENDED/RESUMING instance parked at `sequence` back to
    /// RUNNING, or to CANCELLED if cancellation arrived meanwhile.
    async fn settle(&mut self, sequence: u64) -> Result<(), DurableError> {
        match self.log.status() {
            DurableStatus::Suspended { sequence: s } if s == sequence => {
                self.log.transition(DurableStatus::Resuming { sequence })?;
            }
            DurableStatus::Resuming { sequence: s } if s == sequence => {}
            _ => return Ok(()),
        }
        self.persist().await?;

        if self.cancellation.is_cancelled() {
            self.cancel().await?;
            return Err(DurableError::Cancelled);
        }
        self.log.transition(DurableStatus::Running)?;
        self.persist().await
    }

    async fn ensure_live(&mut self) -> Result<(), DurableError> {
        let status = self.log.status();
        if status == DurableStatus::Cancelled {
            return Err(DurableError::Cancelled);
        }
        if status.is_terminal() {
            return Err(DurableError::InvalidTransition {
                from: status,
                to: DurableStatus::Suspended {
                    sequence: self.log.cursor() + 1,
                },
            });
        }
        if self.cancellation.is_cancelled() {
            self.cancel().await?;
            return Err(DurableError::Cancelled);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), DurableError> {
        self.repository.save_state(self.log.state()).await?;
        Ok(())
    }

    fn emit(&self, build: impl FnOnce(Uuid, String) -> WorkerEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.bus.publish(build(reporter.run_id, reporter.task.clone()));
        }
    }

    fn emit_resumed(&self, sequence: u64, replayed: bool) {
        self.emit(|run_id, task| WorkerEvent::TaskResumed {
            run_id,
            task,
            sequence,
            replayed,
        });
    }
}

/// Earliest time the condition could resolve on time alone.
fn initial_deadline(condition: &Condition, anchored_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let evaluation = ConditionEvaluator::new()
        .evaluate(condition, anchored_at, anchored_at, &[])
        .ok()?;
    if evaluation.satisfied {
        evaluation.satisfied_at
    } else {
        evaluation.next_deadline
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::clock::{Clock, ManualClock};
    use crate::engine::{EngineError, SuspensionBroker, SuspensionTicket};
    use crate::repository::DurableLogRepository;
    use chrono::TimeZone;
    use serde_json::json;
    use taskloom_types::error::RepositoryError;
    use tokio::sync::Notify;

    // -- test doubles -------------------------------------------------------

    #[derive(Default)]
    struct BrokerState {
        registrations: Vec<SuspensionRequest>,
        outcomes: HashMap<(Uuid, u64), SuspendOutcome>,
        awaits: usize,
    }

    #[derive(Clone)]
    struct TestBroker {
        clock: Arc<ManualClock>,
        auto_resolve: bool,
        state: Arc<Mutex<BrokerState>>,
        notify: Arc<Notify>,
    }

    impl TestBroker {
        fn new(clock: Arc<ManualClock>, auto_resolve: bool) -> Self {
            Self {
                clock,
                auto_resolve,
                state: Arc::default(),
                notify: Arc::new(Notify::new()),
            }
        }

        fn registrations(&self) -> usize {
            self.state.lock().unwrap().registrations.len()
        }

        fn awaits(&self) -> usize {
            self.state.lock().unwrap().awaits
        }

        fn resolve(&self, instance: Uuid, sequence: u64, payload: serde_json::Value) {
            let outcome = SuspendOutcome {
                resolved_at: self.clock.now(),
                payload,
            };
            self.state
                .lock()
                .unwrap()
                .outcomes
                .insert((instance, sequence), outcome);
            self.notify.notify_waiters();
        }
    }

    impl SuspensionBroker for TestBroker {
        async fn register_suspension(
            &self,
            request: SuspensionRequest,
        ) -> Result<SuspensionTicket, EngineError> {
            self.state.lock().unwrap().registrations.push(request);
            Ok(SuspensionTicket {
                anchored_at: self.clock.now(),
            })
        }

        async fn await_resolution(
            &self,
            task_instance_id: Uuid,
            sequence: u64,
        ) -> Result<SuspendOutcome, EngineError> {
            self.state.lock().unwrap().awaits += 1;
            if self.auto_resolve {
                self.resolve(task_instance_id, sequence, json!({ "auto": sequence }));
            }
            loop {
                let notified = self.notify.notified();
                if let Some(outcome) = self
                    .state
                    .lock()
                    .unwrap()
                    .outcomes
                    .get(&(task_instance_id, sequence))
                {
                    return Ok(outcome.clone());
                }
                notified.await;
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemoryRepo {
        states: Arc<Mutex<HashMap<Uuid, DurableExecutionState>>>,
    }

    impl MemoryRepo {
        fn get(&self, id: &Uuid) -> Option<DurableExecutionState> {
            self.states.lock().unwrap().get(id).cloned()
        }
    }

    impl DurableLogRepository for MemoryRepo {
        async fn load_state(
            &self,
            id: &Uuid,
        ) -> Result<Option<DurableExecutionState>, RepositoryError> {
            Ok(self.get(id))
        }

        async fn save_state(&self, state: &DurableExecutionState) -> Result<(), RepositoryError> {
            self.states
                .lock()
                .unwrap()
                .insert(state.task_instance_id, state.clone());
            Ok(())
        }

        async fn list_states(&self) -> Result<Vec<DurableExecutionState>, RepositoryError> {
            Ok(self.states.lock().unwrap().values().cloned().collect())
        }

        async fn delete_state(&self, id: &Uuid) -> Result<bool, RepositoryError> {
            Ok(self.states.lock().unwrap().remove(id).is_some())
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        broker: TestBroker,
        repo: MemoryRepo,
        instance: Uuid,
    }

    impl Harness {
        fn new(auto_resolve: bool) -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            ));
            Self {
                broker: TestBroker::new(clock.clone(), auto_resolve),
                clock,
                repo: MemoryRepo::default(),
                instance: Uuid::now_v7(),
            }
        }

        async fn open(&self, token: CancellationToken) -> DurableContext {
            DurableContext::open(
                self.instance,
                BoxSuspensionBroker::new(self.broker.clone()),
                BoxDurableLogRepository::new(self.repo.clone()),
                self.clock.clone(),
                token,
            )
            .await
            .unwrap()
        }

        async fn wait_until_suspended(&self) {
            for _ in 0..200 {
                if let Some(state) = self.repo.get(&self.instance) {
                    if matches!(state.status, DurableStatus::Suspended { .. }) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("instance never suspended");
        }
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn first_sleep_registers_once_and_returns_to_running() {
        let h = Harness::new(true);
        let mut ctx = h.open(CancellationToken::new()).await;

        let result = ctx.sleep_for(Duration::from_secs(10)).await.unwrap();
        assert!(!result.replayed);
        assert_eq!(result.remaining_at_entry, Duration::from_secs(10));
        assert_eq!(result.deadline - result.anchored_at, chrono::Duration::seconds(10));
        assert_eq!(h.broker.registrations(), 1);
        assert_eq!(ctx.status(), DurableStatus::Running);

        let stored = h.repo.get(&h.instance).unwrap();
        assert_eq!(stored.suspend_log.len(), 1);
        assert!(stored.suspend_log[0].is_resolved());
    }

    #[tokio::test]
    async fn sleep_resumed_after_crash_reports_remaining_time() {
        let h = Harness::new(false);

        // First process: suspends, then dies while waiting.
        let first = h.open(CancellationToken::new()).await;
        let task = tokio::spawn(async move {
            let mut ctx = first;
            ctx.sleep_for(Duration::from_secs(10)).await
        });
        h.wait_until_suspended().await;
        task.abort();
        let _ = task.await;

        // Four seconds pass before the task is re-executed.
        h.clock.advance(Duration::from_secs(4));
        h.broker.resolve(h.instance, 1, json!({ "sleep:10s": null }));

        let mut ctx = h.open(CancellationToken::new()).await;
        let result = ctx.sleep_for(Duration::from_secs(10)).await.unwrap();
        assert!(result.replayed);
        assert_eq!(result.remaining_at_entry, Duration::from_secs(6));
        assert_eq!(result.elapsed_before_entry(), Duration::from_secs(4));
        assert_eq!(h.broker.registrations(), 1, "must not re-register");
        assert_eq!(ctx.status(), DurableStatus::Running);
    }

    #[tokio::test]
    async fn resolved_entry_short_circuits_without_engine() {
        let h = Harness::new(true);
        let condition = Condition::or([
            Condition::event("user:update"),
            Condition::sleep(Duration::from_secs(10)),
        ]);

        let mut ctx = h.open(CancellationToken::new()).await;
        let original = ctx.wait_for(condition.clone()).await.unwrap();
        ctx.checkpoint().await.unwrap();
        let awaits = h.broker.awaits();

        // Re-execution with children in a different order: same fingerprint.
        let reordered = Condition::or([
            Condition::sleep(Duration::from_secs(10)),
            Condition::event("user:update"),
        ]);
        let mut replay = h.open(CancellationToken::new()).await;
        let replayed = replay.wait_for(reordered).await.unwrap();

        assert_eq!(replayed, original);
        assert_eq!(h.broker.registrations(), 1);
        assert_eq!(h.broker.awaits(), awaits);
    }

    #[tokio::test]
    async fn sequence_numbers_follow_call_order() {
        let h = Harness::new(true);
        let mut ctx = h.open(CancellationToken::new()).await;
        ctx.sleep_for(Duration::from_secs(1)).await.unwrap();
        ctx.wait_for(Condition::event("a")).await.unwrap();
        ctx.sleep_for(Duration::from_secs(2)).await.unwrap();

        let seqs: Vec<u64> = ctx.state().suspend_log.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(ctx.state().sequence_cursor, 3);
    }

    #[tokio::test]
    async fn different_condition_on_replay_is_a_mismatch() {
        let h = Harness::new(true);
        let mut ctx = h.open(CancellationToken::new()).await;
        ctx.sleep_for(Duration::from_secs(5)).await.unwrap();

        let mut replay = h.open(CancellationToken::new()).await;
        let err = replay.wait_for(Condition::event("other")).await.unwrap_err();
        assert!(matches!(err, DurableError::ReplayMismatch { sequence: 1, .. }));
    }

    #[tokio::test]
    async fn cancellation_while_suspended_moves_to_cancelled() {
        let h = Harness::new(false);
        let token = CancellationToken::new();
        let mut ctx = h.open(token.clone()).await;

        let canceller = {
            let token = token.clone();
            let repo = h.repo.clone();
            let instance = h.instance;
            tokio::spawn(async move {
                for _ in 0..200 {
                    if repo
                        .get(&instance)
                        .is_some_and(|s| matches!(s.status, DurableStatus::Suspended { .. }))
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                token.cancel();
            })
        };

        let err = ctx.sleep_for(Duration::from_secs(60)).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, DurableError::Cancelled));
        assert_eq!(ctx.status(), DurableStatus::Cancelled);
        assert_eq!(
            h.repo.get(&h.instance).unwrap().status,
            DurableStatus::Cancelled
        );

        // Terminal: further suspension points are refused.
        assert!(matches!(
            ctx.sleep_for(Duration::from_secs(1)).await,
            Err(DurableError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn budget_is_paused_only_while_suspended() {
        let h = Harness::new(false);
        let budget = Arc::new(ExecutionBudget::new(Duration::from_secs(60)));
        let ctx = h
            .open(CancellationToken::new())
            .await
            .with_budget(budget.clone());
        assert!(!budget.is_paused());

        let task = tokio::spawn(async move {
            let mut ctx = ctx;
            ctx.wait_for(Condition::event("go")).await
        });
        h.wait_until_suspended().await;
        assert!(budget.is_paused());

        h.broker.resolve(h.instance, 1, json!({ "event:go": 1 }));
        task.await.unwrap().unwrap();
        assert!(!budget.is_paused());
    }

    #[tokio::test]
    async fn colliding_leaves_are_refused_before_suspending() {
        let h = Harness::new(true);
        let mut ctx = h.open(CancellationToken::new()).await;
        let err = ctx
            .wait_for(Condition::or([
                Condition::event("order"),
                Condition::event_matching("order", "payload.vip == true"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, DurableError::InvalidCondition(_)));
        assert_eq!(h.broker.registrations(), 0);
        assert_eq!(ctx.state().sequence_cursor, 0);
    }

    #[tokio::test]
    async fn cancelled_before_resume_never_reenters_running() {
        let h = Harness::new(false);

        let first = h.open(CancellationToken::new()).await;
        let task = tokio::spawn(async move {
            let mut ctx = first;
            ctx.wait_for(Condition::event("go")).await
        });
        h.wait_until_suspended().await;
        task.abort();
        let _ = task.await;

        // The condition resolves, but the run was cancelled in the meantime.
        h.broker.resolve(h.instance, 1, json!({ "event:go": 1 }));
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = h.open(token).await;
        let err = ctx.wait_for(Condition::event("go")).await.unwrap_err();
        assert!(matches!(err, DurableError::Cancelled));
        assert_eq!(ctx.status(), DurableStatus::Cancelled);
    }

    #[tokio::test]
    async fn complete_is_terminal() {
        let h = Harness::new(true);
        let mut ctx = h.open(CancellationToken::new()).await;
        ctx.complete().await.unwrap();
        assert!(matches!(
            ctx.sleep_for(Duration::from_secs(1)).await,
            Err(DurableError::InvalidTransition { .. })
        ));
        assert!(ctx.fail().await.is_err());
    }
}
