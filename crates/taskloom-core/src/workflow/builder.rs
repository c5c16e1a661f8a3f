//! Programmatic workflow declaration.
//!
//! `WorkflowBuilder` accumulates tasks one at a time (or in batches) and
//! rejects structural problems at registration: duplicate names, unknown
//! parents and cycles never reach run time. `build()` yields a [`Workflow`],
//! the validated `WorkflowSpec` plus its handler dispatch table.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use schemars::JsonSchema;
use taskloom_types::condition::Condition;
use taskloom_types::workflow::{
    BackoffPolicy, ConcurrencyExpression, Priority, RateLimitSpec, RetryPolicy, TaskSpec,
    WorkflowSpec,
};

use super::dag;
use super::definition::{WorkflowError, validate_concurrency, validate_spec, validate_task};
use crate::handler::{BoxTaskHandler, TaskHandler};

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// One task: its declaration and the handler that runs it.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    spec: TaskSpec,
    handler: BoxTaskHandler,
}

impl TaskDefinition {
    pub fn new<H: TaskHandler + 'static>(name: impl Into<String>, handler: H) -> Self {
        Self::with_boxed(name, BoxTaskHandler::new(handler))
    }

    pub fn with_boxed(name: impl Into<String>, handler: BoxTaskHandler) -> Self {
        let mut spec = TaskSpec::new(name);
        spec.input_schema = Some(handler.input_schema());
        Self { spec, handler }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn parent(mut self, parent: impl AsRef<str>) -> Self {
        self.spec.parents.push(parent.as_ref().to_string());
        self
    }

    pub fn parents<I, P>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.spec
            .parents
            .extend(parents.into_iter().map(|p| p.as_ref().to_string()));
        self
    }

    /// Mark the task durable: it may call `sleep_for` / `wait_for`.
    pub fn durable(mut self) -> Self {
        self.spec.durable = true;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.spec.retry.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, factor: f64, max_seconds: u64) -> Self {
        self.spec.retry.backoff = Some(BackoffPolicy::new(factor, max_seconds));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry = policy;
        self
    }

    pub fn rate_limit(mut self, limit: RateLimitSpec) -> Self {
        self.spec.rate_limits.push(limit);
        self
    }

    pub fn concurrency(mut self, expr: ConcurrencyExpression) -> Self {
        self.spec.concurrency.push(expr);
        self
    }

    /// Start gate: do not start until `condition` holds.
    pub fn wait_for(mut self, condition: Condition) -> Self {
        self.spec.wait_for = Some(condition);
        self
    }

    pub fn skip_if(mut self, condition: Condition) -> Self {
        self.spec.skip_if = Some(condition);
        self
    }

    pub fn cancel_if(mut self, condition: Condition) -> Self {
        self.spec.cancel_if = Some(condition);
        self
    }

    pub fn schedule_timeout(mut self, timeout: Duration) -> Self {
        self.spec.schedule_timeout = timeout;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.spec.execution_timeout = timeout;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.spec.default_priority = Some(priority);
        self
    }
}

/// Reference to a registered task, usable as a parent of later tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    workflow: String,
    name: String,
}

impl TaskHandle {
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for TaskHandle {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WorkflowBuilder {
    spec: WorkflowSpec,
    handlers: BTreeMap<String, BoxTaskHandler>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: WorkflowSpec::new(name),
            handlers: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = Some(description.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = version.into();
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.spec.default_priority = Some(priority);
        self
    }

    /// Workflow-level concurrency limit over whole runs.
    pub fn concurrency(mut self, expr: ConcurrencyExpression) -> Self {
        self.spec.concurrency.push(expr);
        self
    }

    pub fn on_events<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.triggers.events.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn on_crons<I, S>(mut self, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec
            .triggers
            .crons
            .extend(expressions.into_iter().map(Into::into));
        self
    }

    /// Attach the JSON Schema of the run input type.
    pub fn input_schema<T: JsonSchema>(mut self) -> Self {
        self.spec.input_schema = serde_json::to_value(schemars::schema_for!(T)).ok();
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Names of the tasks registered so far, in insertion order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.spec.tasks.iter().map(|t| t.name.as_str())
    }

    /// Register one task. Every parent must already be registered.
    pub fn register_task(&mut self, def: TaskDefinition) -> Result<TaskHandle, WorkflowError> {
        validate_task(&def.spec)?;
        self.check_name_free(&def.spec.name)?;
        check_not_self_parent(&def.spec)?;
        for parent in &def.spec.parents {
            if !self.spec.tasks.iter().any(|t| &t.name == parent) {
                return Err(WorkflowError::UnknownParentReference {
                    task: def.spec.name.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let mut candidate = self.spec.tasks.clone();
        candidate.push(def.spec.clone());
        dag::validate_dag(&candidate)?;

        tracing::debug!(workflow = %self.spec.name, task = %def.spec.name, "task registered");
        Ok(self.insert(def))
    }

    /// Register a batch of tasks given in any order.
    ///
    /// Parents may reference other members of the batch. Tasks are inserted
    /// in topological order; on any error nothing is inserted.
    pub fn register_tasks<I>(&mut self, defs: I) -> Result<Vec<TaskHandle>, WorkflowError>
    where
        I: IntoIterator<Item = TaskDefinition>,
    {
        let batch: Vec<TaskDefinition> = defs.into_iter().collect();

        let mut batch_names = HashSet::new();
        for def in &batch {
            validate_task(&def.spec)?;
            self.check_name_free(&def.spec.name)?;
            if !batch_names.insert(def.spec.name.as_str()) {
                return Err(WorkflowError::DuplicateTaskName(def.spec.name.clone()));
            }
            check_not_self_parent(&def.spec)?;
        }
        for def in &batch {
            for parent in &def.spec.parents {
                let known = batch_names.contains(parent.as_str())
                    || self.spec.tasks.iter().any(|t| &t.name == parent);
                if !known {
                    return Err(WorkflowError::UnknownParentReference {
                        task: def.spec.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let existing = self.spec.tasks.len();
        let union: Vec<TaskSpec> = self
            .spec
            .tasks
            .iter()
            .cloned()
            .chain(batch.iter().map(|d| d.spec.clone()))
            .collect();
        let order = dag::topological_order(&union)?;

        let mut slots: Vec<Option<TaskDefinition>> = batch.into_iter().map(Some).collect();
        let mut handles = Vec::with_capacity(slots.len());
        for idx in order.into_iter().filter(|&i| i >= existing) {
            if let Some(def) = slots.get_mut(idx - existing).and_then(Option::take) {
                handles.push(self.insert(def));
            }
        }

        tracing::debug!(workflow = %self.spec.name, count = handles.len(), "task batch registered");
        Ok(handles)
    }

    /// Handler run after the workflow fails.
    pub fn on_failure(&mut self, def: TaskDefinition) -> Result<TaskHandle, WorkflowError> {
        let def = self.prepare_terminal(def)?;
        let handle = self.handle(&def.spec.name);
        self.handlers.insert(def.spec.name.clone(), def.handler);
        self.spec.on_failure = Some(def.spec);
        Ok(handle)
    }

    /// Handler run after the workflow succeeds.
    pub fn on_success(&mut self, def: TaskDefinition) -> Result<TaskHandle, WorkflowError> {
        let def = self.prepare_terminal(def)?;
        let handle = self.handle(&def.spec.name);
        self.handlers.insert(def.spec.name.clone(), def.handler);
        self.spec.on_success = Some(def.spec);
        Ok(handle)
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        for expr in &self.spec.concurrency {
            validate_concurrency(expr)?;
        }
        validate_spec(&self.spec)?;
        tracing::debug!(
            workflow = %self.spec.name,
            tasks = self.spec.tasks.len(),
            "workflow built"
        );
        Ok(Workflow {
            spec: self.spec,
            handlers: self.handlers,
        })
    }

    fn prepare_terminal(&self, def: TaskDefinition) -> Result<TaskDefinition, WorkflowError> {
        validate_task(&def.spec)?;
        if !def.spec.parents.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "terminal handler '{}' must not declare parents",
                def.spec.name
            )));
        }
        // Replacing an existing terminal handler of the same name is allowed.
        let replaces = [&self.spec.on_failure, &self.spec.on_success]
            .into_iter()
            .flatten()
            .any(|t| t.name == def.spec.name);
        if !replaces {
            self.check_name_free(&def.spec.name)?;
        }
        Ok(def)
    }

    fn check_name_free(&self, name: &str) -> Result<(), WorkflowError> {
        let taken = self
            .spec
            .tasks
            .iter()
            .chain(self.spec.on_failure.iter())
            .chain(self.spec.on_success.iter())
            .any(|t| t.name == name);
        if taken {
            return Err(WorkflowError::DuplicateTaskName(name.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, def: TaskDefinition) -> TaskHandle {
        let handle = self.handle(&def.spec.name);
        self.handlers.insert(def.spec.name.clone(), def.handler);
        self.spec.tasks.push(def.spec);
        handle
    }

    fn handle(&self, name: &str) -> TaskHandle {
        TaskHandle {
            workflow: self.spec.name.clone(),
            name: name.to_string(),
        }
    }
}

fn check_not_self_parent(spec: &TaskSpec) -> Result<(), WorkflowError> {
    if spec.parents.iter().any(|p| p == &spec.name) {
        return Err(WorkflowError::CycleDetected(format!(
            "task '{}' lists itself as a parent",
            spec.name
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A validated workflow declaration bound to its handlers.
#[derive(Debug, Clone)]
pub struct Workflow {
    spec: WorkflowSpec,
    handlers: BTreeMap<String, BoxTaskHandler>,
}

impl Workflow {
    /// Bind handlers (by task name) to a declarative spec, e.g. one loaded
    /// from YAML.
    pub fn from_spec<I>(spec: WorkflowSpec, handlers: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = (String, BoxTaskHandler)>,
    {
        validate_spec(&spec)?;
        let handlers: BTreeMap<String, BoxTaskHandler> = handlers.into_iter().collect();
        for name in handlers.keys() {
            if spec.task(name).is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "handler bound to unknown task '{name}'"
                )));
            }
        }
        let all_tasks = spec
            .tasks
            .iter()
            .chain(spec.on_failure.iter())
            .chain(spec.on_success.iter());
        for task in all_tasks {
            if !handlers.contains_key(&task.name) {
                return Err(WorkflowError::MissingHandler(task.name.clone()));
            }
        }
        Ok(Self { spec, handlers })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Same workflow under another name (worker namespacing).
    pub(crate) fn renamed(mut self, name: String) -> Self {
        self.spec.name = name;
        self
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    pub fn handler(&self, task: &str) -> Option<&BoxTaskHandler> {
        self.handlers.get(task)
    }

    pub fn handlers(&self) -> impl Iterator<Item = (&str, &BoxTaskHandler)> {
        self.handlers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Root tasks' handlers, which receive the run input.
    pub fn root_handlers(&self) -> impl Iterator<Item = (&str, &BoxTaskHandler)> {
        self.spec
            .roots()
            .filter_map(|t| self.handlers.get(&t.name).map(|h| (t.name.as_str(), h)))
    }
}
