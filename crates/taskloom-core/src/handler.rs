//! Task handlers and the dispatch table.
//!
//! Authors implement [`TaskHandler`] with typed input and output (or wrap a
//! closure with [`handler_fn`]). The worker only sees the type-erased
//! [`BoxTaskHandler`], which deserializes input at the boundary: a payload
//! that does not fit `Input` is a non-retryable validation failure and the
//! handler body never runs.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use taskloom_types::run::{FailureKind, TaskFailure};
use taskloom_types::workflow::TaskId;

use crate::context::TaskContext;
use crate::workflow::durable::DurableError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by a task body.
///
/// `NonRetryable` bypasses the retry policy. Only `Transient` is retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    NonRetryable(String),

    #[error("{0}")]
    Transient(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NonRetryable(_) => FailureKind::NonRetryable,
            Self::Transient(_) => FailureKind::Transient,
            Self::Validation(_) => FailureKind::Validation,
            Self::Expression(_) => FailureKind::Expression,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Timeout(_) => FailureKind::Timeout,
        }
    }

    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<DurableError> for TaskError {
    fn from(err: DurableError) -> Self {
        match err {
            DurableError::Cancelled => Self::Cancelled,
            // Non-deterministic handler: retrying replays the same mismatch.
            DurableError::ReplayMismatch { .. }
            | DurableError::SequenceGap { .. }
            | DurableError::InvalidTransition { .. }
            | DurableError::InvalidCondition(_) => Self::NonRetryable(err.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// A typed task body.
pub trait TaskHandler: Send + Sync {
    type Input: DeserializeOwned + JsonSchema + Send + 'static;
    type Output: Serialize + Send + 'static;

    fn execute(
        &self,
        input: Self::Input,
        ctx: TaskContext,
    ) -> impl Future<Output = Result<Self::Output, TaskError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`TaskHandler`] working on JSON values.
pub trait TaskHandlerDyn: Send + Sync {
    /// JSON Schema of the handler's input type.
    fn input_schema(&self) -> Value;

    /// Check that `input` deserializes into the handler's input type.
    fn validate_input(&self, input: &Value) -> Result<(), TaskError>;

    fn execute_boxed(&self, input: Value, ctx: TaskContext) -> BoxFuture<'_, Result<Value, TaskError>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(T::Input)).unwrap_or(Value::Null)
    }

    fn validate_input(&self, input: &Value) -> Result<(), TaskError> {
        decode_input::<T::Input>(input.clone()).map(|_| ())
    }

    fn execute_boxed(&self, input: Value, ctx: TaskContext) -> BoxFuture<'_, Result<Value, TaskError>> {
        Box::pin(async move {
            let typed = decode_input::<T::Input>(input)?;
            let output = self.execute(typed, ctx).await?;
            serde_json::to_value(output)
                .map_err(|e| TaskError::NonRetryable(format!("output is not serializable: {e}")))
        })
    }
}

fn decode_input<I: DeserializeOwned>(input: Value) -> Result<I, TaskError> {
    serde_json::from_value(input).map_err(|e| TaskError::Validation(e.to_string()))
}

/// Type-erased task handler. Cheap to clone.
#[derive(Clone)]
pub struct BoxTaskHandler {
    inner: Arc<dyn TaskHandlerDyn + Send + Sync>,
}

impl BoxTaskHandler {
    pub fn new<T: TaskHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    pub fn validate_input(&self, input: &Value) -> Result<(), TaskError> {
        self.inner.validate_input(input)
    }

    pub async fn execute(&self, input: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        self.inner.execute_boxed(input, ctx).await
    }
}

impl std::fmt::Debug for BoxTaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTaskHandler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// A [`TaskHandler`] backed by an async closure. Built by [`handler_fn`].
pub struct FnHandler<F, I, O> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, Fut, I, O> TaskHandler for FnHandler<F, I, O>
where
    F: Fn(I, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, TaskError>> + Send,
    I: DeserializeOwned + JsonSchema + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn execute(
        &self,
        input: I,
        ctx: TaskContext,
    ) -> impl Future<Output = Result<O, TaskError>> + Send {
        (self.f)(input, ctx)
    }
}

/// Wrap an async closure as a task handler.
pub fn handler_fn<F, Fut, I, O>(f: F) -> FnHandler<F, I, O>
where
    F: Fn(I, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, TaskError>> + Send,
    I: DeserializeOwned + JsonSchema + Send + 'static,
    O: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Dispatch table from `(workflow, task)` to handler.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: DashMap<TaskId, BoxTaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler, replacing any previous binding.
    pub fn insert(&self, id: TaskId, handler: BoxTaskHandler) {
        tracing::debug!(task = %id, "handler bound");
        self.handlers.insert(id, handler);
    }

    pub fn get(&self, id: &TaskId) -> Option<BoxTaskHandler> {
        self.handlers.get(id).map(|h| h.value().clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.handlers.contains_key(id)
    }

    /// Drop every binding of one workflow.
    pub fn remove_workflow(&self, workflow: &str) {
        self.handlers.retain(|id, _| id.workflow != workflow);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
