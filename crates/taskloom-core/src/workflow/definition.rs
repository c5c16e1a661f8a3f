//! Declarative workflow definitions: YAML parsing, validation and filesystem
//! load/save.
//!
//! A YAML file deserializes straight into a `WorkflowSpec`. Validation applies
//! the same rules as the programmatic builder, with the difference that tasks
//! may appear in any order in a file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::json;
use taskloom_types::workflow::{
    ConcurrencyExpression, RateLimitKey, RateLimitSpec, TaskSpec, WorkflowSpec,
};

use super::condition::validate_condition;
use super::dag;
use super::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while declaring, parsing or validating a workflow.
///
/// All of these surface synchronously at registration time.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("duplicate task name: '{0}'")]
    DuplicateTaskName(String),

    #[error("task '{task}' references unknown parent '{parent}'")]
    UnknownParentReference { task: String, parent: String },

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A concurrency, rate-limit or event expression cannot compile.
    #[error("malformed expression '{expression}': {reason}")]
    MalformedExpression { expression: String, reason: String },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A declared task has no handler in the dispatch table.
    #[error("no handler bound for task '{0}'")]
    MissingHandler(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowSpec`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowSpec, WorkflowError> {
    let spec: WorkflowSpec =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_spec(&spec)?;
    Ok(spec)
}

/// Serialize a `WorkflowSpec` to a YAML string.
pub fn serialize_workflow_yaml(spec: &WorkflowSpec) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(spec).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a complete workflow spec.
///
/// Checks:
/// - Name is non-empty and uses only alphanumerics, `-`, `_`, `.` or `:`
/// - At least one task exists
/// - Task names are unique (terminal handlers included)
/// - Every parent exists and the parent relation is acyclic
/// - Terminal handlers declare no parents
/// - Task policies, workflow concurrency and cron triggers are well formed
pub fn validate_spec(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    validate_name("workflow", &spec.name)?;

    if spec.tasks.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one task".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for task in spec
        .tasks
        .iter()
        .chain(spec.on_failure.iter())
        .chain(spec.on_success.iter())
    {
        if !seen.insert(task.name.as_str()) {
            return Err(WorkflowError::DuplicateTaskName(task.name.clone()));
        }
    }

    for task in &spec.tasks {
        for parent in &task.parents {
            if parent == &task.name {
                return Err(WorkflowError::CycleDetected(format!(
                    "task '{}' lists itself as a parent",
                    task.name
                )));
            }
            if !spec.tasks.iter().any(|t| &t.name == parent) {
                return Err(WorkflowError::UnknownParentReference {
                    task: task.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }
    dag::validate_dag(&spec.tasks)?;

    for task in &spec.tasks {
        validate_task(task)?;
    }
    for terminal in spec.on_failure.iter().chain(spec.on_success.iter()) {
        if !terminal.parents.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "terminal handler '{}' must not declare parents",
                terminal.name
            )));
        }
        validate_task(terminal)?;
    }

    for expr in &spec.concurrency {
        validate_concurrency(expr)?;
    }
    for cron in &spec.triggers.crons {
        validate_cron(cron)?;
    }
    for event in &spec.triggers.events {
        if event.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "event trigger key must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validate one task's own attachments (not its graph position).
pub fn validate_task(task: &TaskSpec) -> Result<(), WorkflowError> {
    validate_name("task", &task.name)?;

    if task.execution_timeout.is_zero() {
        return Err(WorkflowError::ValidationError(format!(
            "task '{}': execution timeout must be > 0",
            task.name
        )));
    }
    if task.schedule_timeout.is_zero() {
        return Err(WorkflowError::ValidationError(format!(
            "task '{}': schedule timeout must be > 0",
            task.name
        )));
    }

    if let Some(backoff) = &task.retry.backoff {
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}': backoff factor must be >= 1.0",
                task.name
            )));
        }
        if !backoff.base_seconds.is_finite() || backoff.base_seconds <= 0.0 {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}': backoff base must be > 0",
                task.name
            )));
        }
    }

    for limit in &task.rate_limits {
        validate_rate_limit(&task.name, limit)?;
    }
    for expr in &task.concurrency {
        validate_concurrency(expr)?;
    }
    for condition in [&task.wait_for, &task.skip_if, &task.cancel_if]
        .into_iter()
        .flatten()
    {
        validate_condition(condition)?;
    }

    Ok(())
}

/// Validate a concurrency expression: `max_runs >= 1` and a compilable key.
pub fn validate_concurrency(expr: &ConcurrencyExpression) -> Result<(), WorkflowError> {
    if expr.max_runs == 0 {
        return Err(WorkflowError::ValidationError(format!(
            "concurrency '{}': max_runs must be >= 1",
            expr.expression
        )));
    }
    check_input_expression(&expr.expression)
}

fn validate_rate_limit(task: &str, limit: &RateLimitSpec) -> Result<(), WorkflowError> {
    if limit.units == 0 {
        return Err(WorkflowError::ValidationError(format!(
            "task '{task}': rate limit units must be >= 1"
        )));
    }
    match &limit.key {
        RateLimitKey::Static(key) => {
            if key.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "task '{task}': static rate limit key must not be empty"
                )));
            }
            if limit.limit.is_some() || limit.duration.is_some() {
                return Err(WorkflowError::ValidationError(format!(
                    "task '{task}': static rate limit '{key}' must not carry an inline limit"
                )));
            }
        }
        RateLimitKey::Dynamic(expression) => {
            match limit.limit {
                Some(0) | None => {
                    return Err(WorkflowError::ValidationError(format!(
                        "task '{task}': dynamic rate limit '{expression}' needs a limit >= 1"
                    )));
                }
                Some(_) => {}
            }
            check_input_expression(expression)?;
        }
    }
    Ok(())
}

fn check_input_expression(expression: &str) -> Result<(), WorkflowError> {
    let sample = json!({ "input": {}, "additional_metadata": {} });
    ExpressionEvaluator::new()
        .check(expression, &sample)
        .map_err(|e| WorkflowError::MalformedExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Validate a cron trigger expression.
pub fn validate_cron(expression: &str) -> Result<(), WorkflowError> {
    expression
        .parse::<croner::Cron>()
        .map(|_| ())
        .map_err(|e| WorkflowError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

fn validate_name(kind: &str, name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "{kind} name must not be empty"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(WorkflowError::ValidationError(format!(
            "{kind} name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow spec from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowSpec, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow spec to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(spec)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, WorkflowSpec)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowSpec)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(spec) => results.push((path, spec)),
                Err(err) => {
                    tracing::warn!(?path, error = %err, "skipping invalid workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskloom_types::condition::Condition;
    use taskloom_types::workflow::{
        BackoffPolicy, ConcurrencyLimitStrategy, Priority, RateLimitDuration,
    };

    const USER_SYNC: &str = r#"
name: user-sync
description: Sync a user profile
triggers:
  events: ["user:created"]
default_priority: LOW
concurrency:
  - expression: input.user_id
    max_runs: 5
    limit_strategy: CANCEL_IN_PROGRESS
tasks:
  - name: notify
    parents: [fetch]
    durable: true
    default_priority: MEDIUM
    wait_for:
      op: OR
      children:
        - { type: event, key: "user:update" }
        - { type: sleep, duration: 10s }
  - name: fetch
    execution_timeout: 30s
    retry:
      max_retries: 3
      backoff: { factor: 2.0, max_seconds: 10 }
    rate_limits:
      - key: { static: external-api }
        units: 1
"#;

    fn task(name: &str, parents: &[&str]) -> TaskSpec {
        let mut t = TaskSpec::new(name);
        t.parents = parents.iter().map(|p| p.to_string()).collect();
        t
    }

    fn workflow(tasks: Vec<TaskSpec>) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new("wf");
        spec.tasks = tasks;
        spec
    }

    #[test]
    fn test_parse_yaml_in_any_order() {
        let spec = parse_workflow_yaml(USER_SYNC).unwrap();
        assert_eq!(spec.name, "user-sync");
        assert_eq!(spec.version, "1.0.0");
        assert_eq!(spec.default_priority, Some(Priority::Low));
        assert_eq!(
            spec.concurrency[0].limit_strategy,
            ConcurrencyLimitStrategy::CancelInProgress
        );

        let fetch = spec.task("fetch").unwrap();
        assert_eq!(fetch.execution_timeout, Duration::from_secs(30));
        assert_eq!(fetch.retry.max_retries, 3);
        assert_eq!(fetch.retry.backoff, Some(BackoffPolicy::new(2.0, 10)));

        let notify = spec.task("notify").unwrap();
        assert!(notify.durable);
        assert_eq!(
            notify.wait_for,
            Some(Condition::or([
                Condition::event("user:update"),
                Condition::sleep(Duration::from_secs(10)),
            ]))
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let spec = parse_workflow_yaml(USER_SYNC).unwrap();
        let yaml = serialize_workflow_yaml(&spec).unwrap();
        let reparsed = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(reparsed, spec);
    }

    #[test]
    fn test_cycle_in_yaml_rejected() {
        let yaml = r#"
name: loop
tasks:
  - { name: a, parents: [c] }
  - { name: b, parents: [a] }
  - { name: c, parents: [b] }
"#;
        assert!(matches!(
            parse_workflow_yaml(yaml),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_self_parent_is_a_cycle() {
        let spec = workflow(vec![task("a", &["a"])]);
        assert!(matches!(
            validate_spec(&spec),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_parent() {
        let dup = workflow(vec![task("a", &[]), task("a", &[])]);
        assert!(matches!(
            validate_spec(&dup),
            Err(WorkflowError::DuplicateTaskName(name)) if name == "a"
        ));

        let unknown = workflow(vec![task("a", &["ghost"])]);
        assert!(matches!(
            validate_spec(&unknown),
            Err(WorkflowError::UnknownParentReference { parent, .. }) if parent == "ghost"
        ));
    }

    #[test]
    fn test_terminal_handler_name_collision() {
        let mut spec = workflow(vec![task("a", &[])]);
        spec.on_failure = Some(task("a", &[]));
        assert!(matches!(
            validate_spec(&spec),
            Err(WorkflowError::DuplicateTaskName(_))
        ));
    }

    #[test]
    fn test_terminal_handler_with_parents_rejected() {
        let mut spec = workflow(vec![task("a", &[])]);
        spec.on_success = Some(task("done", &["a"]));
        assert!(matches!(
            validate_spec(&spec),
            Err(WorkflowError::ValidationError(_))
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(validate_spec(&workflow(vec![])).is_err());
    }

    #[test]
    fn test_static_rate_limit_with_inline_limit_rejected() {
        let mut t = task("a", &[]);
        let mut limit = RateLimitSpec::fixed("api", 1);
        limit.limit = Some(10);
        t.rate_limits = vec![limit];
        assert!(matches!(validate_task(&t), Err(WorkflowError::ValidationError(_))));
    }

    #[test]
    fn test_dynamic_rate_limit_needs_limit() {
        let mut t = task("a", &[]);
        let mut limit = RateLimitSpec::dynamic("input.tenant", 1, 10, RateLimitDuration::Minute);
        limit.limit = None;
        t.rate_limits = vec![limit];
        assert!(matches!(validate_task(&t), Err(WorkflowError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_concurrency_expression() {
        let mut t = task("a", &[]);
        t.concurrency = vec![ConcurrencyExpression::new(
            "input.user_id ==",
            1,
            ConcurrencyLimitStrategy::CancelNewest,
        )];
        assert!(matches!(
            validate_task(&t),
            Err(WorkflowError::MalformedExpression { .. })
        ));
    }

    #[test]
    fn test_zero_max_runs_rejected() {
        let expr = ConcurrencyExpression::new("input.k", 0, ConcurrencyLimitStrategy::CancelNewest);
        assert!(validate_concurrency(&expr).is_err());
    }

    #[test]
    fn test_cron_validation() {
        assert!(validate_cron("0 9 * * *").is_ok());
        assert!(matches!(
            validate_cron("not a cron"),
            Err(WorkflowError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_backoff_factor_below_one_rejected() {
        let mut t = task("a", &[]);
        t.retry = taskloom_types::workflow::RetryPolicy::retries(2)
            .with_backoff(BackoffPolicy::new(0.5, 10));
        assert!(validate_task(&t).is_err());
    }

    #[test]
    fn test_save_load_and_discover() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spec = parse_workflow_yaml(USER_SYNC).unwrap();
        let path = tmp.path().join("nested").join("user-sync.yaml");
        save_workflow_file(&path, &spec).unwrap();
        std::fs::write(tmp.path().join("broken.yml"), "name: [").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded, spec);

        let found = discover_workflows(tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "user-sync");
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let found = discover_workflows(Path::new("/definitely/not/here")).unwrap();
        assert!(found.is_empty());
    }
}
