//! Workflow declaration types for Taskloom.
//!
//! `WorkflowSpec` is the canonical, serialisable shape of a workflow: the
//! builder API in `taskloom-core` and declarative YAML files both produce it,
//! and it is what gets registered with the orchestration engine. Handlers are
//! not part of the spec; they live in the worker's dispatch table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority of a run or task. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Priority {
    /// The global baseline used when nothing more specific is declared.
    pub const BASELINE: Priority = Priority::Low;

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::BASELINE
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// What happens when a concurrency group is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyLimitStrategy {
    /// Preempt the oldest in-flight run sharing the key.
    CancelInProgress,
    /// Cancel the newcomer and leave in-flight runs alone.
    CancelNewest,
    /// Queue the newcomer; admit fairly across distinct keys as slots free up.
    GroupRoundRobin,
}

/// A concurrency limit keyed by an expression over the trigger input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyExpression {
    /// JEXL expression evaluated against `{ input, additional_metadata }`
    /// producing the group key (e.g. `input.user_id`).
    pub expression: String,
    /// Maximum concurrently active runs per group key.
    pub max_runs: u32,
    /// Behaviour when the group is full.
    pub limit_strategy: ConcurrencyLimitStrategy,
}

impl ConcurrencyExpression {
    pub fn new(
        expression: impl Into<String>,
        max_runs: u32,
        limit_strategy: ConcurrencyLimitStrategy,
    ) -> Self {
        Self {
            expression: expression.into(),
            max_runs,
            limit_strategy,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// How a rate-limit bucket is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// References a bucket registered ahead of time.
    Static(String),
    /// Expression over the trigger input computing a bucket per run.
    Dynamic(String),
}

/// Rate-limit window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDuration {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl RateLimitDuration {
    pub fn as_duration(self) -> Duration {
        let secs = match self {
            RateLimitDuration::Second => 1,
            RateLimitDuration::Minute => 60,
            RateLimitDuration::Hour => 3_600,
            RateLimitDuration::Day => 86_400,
            RateLimitDuration::Week => 604_800,
            RateLimitDuration::Month => 2_592_000,
            RateLimitDuration::Year => 31_536_000,
        };
        Duration::from_secs(secs)
    }
}

impl Default for RateLimitDuration {
    fn default() -> Self {
        RateLimitDuration::Minute
    }
}

/// A rate-limit consumption declared on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub key: RateLimitKey,
    /// Units consumed per run.
    #[serde(default = "default_units")]
    pub units: u32,
    /// Inline limit (dynamic keys only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Inline window (dynamic keys only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<RateLimitDuration>,
}

fn default_units() -> u32 {
    1
}

impl RateLimitSpec {
    /// Consume `units` from a pre-registered bucket.
    pub fn fixed(key: impl Into<String>, units: u32) -> Self {
        Self {
            key: RateLimitKey::Static(key.into()),
            units,
            limit: None,
            duration: None,
        }
    }

    /// Consume `units` from a per-run bucket computed by `expression`.
    pub fn dynamic(
        expression: impl Into<String>,
        units: u32,
        limit: u32,
        duration: RateLimitDuration,
    ) -> Self {
        Self {
            key: RateLimitKey::Dynamic(expression.into()),
            units,
            limit: Some(limit),
            duration: Some(duration),
        }
    }
}

/// A bucket registered with the engine before any run references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRateLimit {
    pub key: String,
    pub limit: u32,
    #[serde(default)]
    pub duration: RateLimitDuration,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Delay growth between retries: `min(base * factor^i, max_seconds)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub factor: f64,
    pub max_seconds: u64,
    #[serde(default = "default_base_seconds")]
    pub base_seconds: f64,
}

fn default_base_seconds() -> f64 {
    1.0
}

impl BackoffPolicy {
    pub fn new(factor: f64, max_seconds: u64) -> Self {
        Self {
            factor,
            max_seconds,
            base_seconds: default_base_seconds(),
        }
    }

    pub fn with_base_seconds(mut self, base_seconds: f64) -> Self {
        self.base_seconds = base_seconds;
        self
    }
}

/// Per-task retry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

// ---------------------------------------------------------------------------
// Task spec
// ---------------------------------------------------------------------------

/// Default time a task may wait for a slot before the engine gives up.
pub const DEFAULT_SCHEDULE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wall-clock limit for a single attempt.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Serialisable declaration of one task in a workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow.
    pub name: String,
    /// Names of tasks this task depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    /// Whether the task may suspend with `sleep_for` / `wait_for`.
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimitSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyExpression>,
    /// Gate: the task starts only once this condition is satisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<Condition>,
    /// Gate: the task is skipped if this condition is satisfied first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<Condition>,
    /// Gate: the task (and the run) is cancelled if this condition is satisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_if: Option<Condition>,
    #[serde(
        default = "default_schedule_timeout",
        with = "crate::duration::serde_str"
    )]
    pub schedule_timeout: Duration,
    #[serde(
        default = "default_execution_timeout",
        with = "crate::duration::serde_str"
    )]
    pub execution_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<Priority>,
    /// JSON Schema of the handler input, filled in from the handler type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

fn default_schedule_timeout() -> Duration {
    DEFAULT_SCHEDULE_TIMEOUT
}

fn default_execution_timeout() -> Duration {
    DEFAULT_EXECUTION_TIMEOUT
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
            durable: false,
            retry: RetryPolicy::default(),
            rate_limits: Vec::new(),
            concurrency: Vec::new(),
            wait_for: None,
            skip_if: None,
            cancel_if: None,
            schedule_timeout: DEFAULT_SCHEDULE_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            default_priority: None,
            input_schema: None,
        }
    }

    /// Whether any start gate is attached.
    pub fn has_gates(&self) -> bool {
        self.wait_for.is_some() || self.skip_if.is_some() || self.cancel_if.is_some()
    }
}

// ---------------------------------------------------------------------------
// Workflow spec
// ---------------------------------------------------------------------------

/// How a workflow can be started besides an explicit run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTriggers {
    /// Event keys that start a run with the event payload as input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Cron expressions evaluated by the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crons: Vec<String>,
}

impl WorkflowTriggers {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.crons.is_empty()
    }
}

/// The canonical, serialisable workflow declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "WorkflowTriggers::is_empty")]
    pub triggers: WorkflowTriggers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<Priority>,
    /// Workflow-level concurrency, applied to whole runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyExpression>,
    /// JSON Schema of the trigger input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Tasks in registration (topological) order.
    pub tasks: Vec<TaskSpec>,
    /// Invoked by the engine after a run fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<TaskSpec>,
    /// Invoked by the engine after a run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<TaskSpec>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            triggers: WorkflowTriggers::default(),
            default_priority: None,
            concurrency: Vec::new(),
            input_schema: None,
            tasks: Vec::new(),
            on_failure: None,
            on_success: None,
        }
    }

    /// Look up a DAG task, or one of the terminal handlers, by name.
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks
            .iter()
            .chain(self.on_failure.iter())
            .chain(self.on_success.iter())
            .find(|t| t.name == name)
    }

    /// Tasks without parents.
    pub fn roots(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter().filter(|t| t.parents.is_empty())
    }

    /// Tasks that list `name` as a parent.
    pub fn children_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TaskSpec> + 'a {
        self.tasks
            .iter()
            .filter(move |t| t.parents.iter().any(|p| p == name))
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Fully qualified task identity: the key of the handler dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub workflow: String,
    pub task: String,
}

impl TaskId {
    pub fn new(workflow: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            task: task.into(),
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow, self.task)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> WorkflowSpec {
        let mut first = TaskSpec::new("fetch");
        first.retry = RetryPolicy::retries(3).with_backoff(BackoffPolicy::new(2.0, 10));
        first.rate_limits = vec![RateLimitSpec::fixed("external-api", 1)];

        let mut second = TaskSpec::new("notify");
        second.parents = vec!["fetch".to_string()];
        second.durable = true;
        second.wait_for = Some(Condition::or([
            Condition::event("user:update"),
            Condition::sleep(Duration::from_secs(10)),
        ]));
        second.default_priority = Some(Priority::Medium);

        let mut spec = WorkflowSpec::new("user-sync");
        spec.default_priority = Some(Priority::Low);
        spec.concurrency = vec![ConcurrencyExpression::new(
            "input.user_id",
            5,
            ConcurrencyLimitStrategy::CancelInProgress,
        )];
        spec.triggers.events = vec!["user:created".to_string()];
        spec.tasks = vec![first, second];
        spec
    }

    #[test]
    fn test_priority_ordering_and_wire_names() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Low);
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!("HIGH"));
        assert_eq!(Priority::Medium.as_i32(), 2);
    }

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(
            serde_json::to_value(ConcurrencyLimitStrategy::CancelInProgress).unwrap(),
            json!("CANCEL_IN_PROGRESS")
        );
        assert_eq!(
            serde_json::to_value(ConcurrencyLimitStrategy::GroupRoundRobin).unwrap(),
            json!("GROUP_ROUND_ROBIN")
        );
    }

    #[test]
    fn test_rate_limit_key_shapes() {
        let fixed = serde_json::to_value(RateLimitSpec::fixed("api", 2)).unwrap();
        assert_eq!(fixed, json!({ "key": { "static": "api" }, "units": 2 }));

        let dynamic = serde_json::to_value(RateLimitSpec::dynamic(
            "input.tenant",
            1,
            10,
            RateLimitDuration::Hour,
        ))
        .unwrap();
        assert_eq!(
            dynamic,
            json!({
                "key": { "dynamic": "input.tenant" },
                "units": 1,
                "limit": 10,
                "duration": "hour"
            })
        );
    }

    #[test]
    fn test_task_spec_defaults_from_minimal_json() {
        let task: TaskSpec = serde_json::from_value(json!({ "name": "a" })).unwrap();
        assert_eq!(task.schedule_timeout, DEFAULT_SCHEDULE_TIMEOUT);
        assert_eq!(task.execution_timeout, DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(task.retry.max_retries, 0);
        assert!(!task.durable);
        assert!(!task.has_gates());
    }

    #[test]
    fn test_timeouts_use_duration_strings() {
        let mut task = TaskSpec::new("a");
        task.execution_timeout = Duration::from_secs(90);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["execution_timeout"], json!("90s"));
        assert_eq!(value["schedule_timeout"], json!("5m"));
    }

    #[test]
    fn test_workflow_spec_serde_roundtrip() {
        let spec = sample_workflow();
        let text = serde_json::to_string(&spec).unwrap();
        let parsed: WorkflowSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_workflow_lookup_helpers() {
        let spec = sample_workflow();
        assert!(spec.task("notify").is_some());
        assert!(spec.task("missing").is_none());
        let roots: Vec<&str> = spec.roots().map(|t| t.name.as_str()).collect();
        assert_eq!(roots, vec!["fetch"]);
        let children: Vec<&str> = spec.children_of("fetch").map(|t| t.name.as_str()).collect();
        assert_eq!(children, vec!["notify"]);
    }

    #[test]
    fn test_rate_limit_duration_lengths() {
        assert_eq!(RateLimitDuration::Second.as_duration(), Duration::from_secs(1));
        assert_eq!(RateLimitDuration::Hour.as_duration(), Duration::from_secs(3_600));
        assert_eq!(RateLimitDuration::default(), RateLimitDuration::Minute);
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::new("wf", "step").to_string(), "wf:step");
    }
}
