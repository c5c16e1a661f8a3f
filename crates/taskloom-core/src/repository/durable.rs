//! Durable log repository trait definition.
//!
//! Stores per-instance `DurableExecutionState` so a durable task can replay
//! its suspension points after a process restart. The infrastructure layer
//! (taskloom-infra) implements this trait with SQLite and in-memory storage.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use taskloom_types::durable::DurableExecutionState;
use taskloom_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for durable execution state.
///
/// Implementations must keep the suspend log append-only: `save_state` may
/// add entries and fill in a missing outcome, but never renumber, drop or
/// rewrite an entry that is already stored.
pub trait DurableLogRepository: Send + Sync {
    /// Load the state of one task instance.
    fn load_state(
        &self,
        task_instance_id: &Uuid,
    ) -> impl Future<Output = Result<Option<DurableExecutionState>, RepositoryError>> + Send;

    /// Upsert the state header and any new or newly resolved entries.
    fn save_state(
        &self,
        state: &DurableExecutionState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// List all stored states, most recently updated first.
    fn list_states(
        &self,
    ) -> impl Future<Output = Result<Vec<DurableExecutionState>, RepositoryError>> + Send;

    /// Delete one instance. Returns `true` if it existed.
    fn delete_state(
        &self,
        task_instance_id: &Uuid,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch wrapper
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`DurableLogRepository`].
pub trait DurableLogRepositoryDyn: Send + Sync {
    fn load_state_boxed<'a>(
        &'a self,
        task_instance_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Option<DurableExecutionState>, RepositoryError>>;

    fn save_state_boxed<'a>(
        &'a self,
        state: &'a DurableExecutionState,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;

    fn list_states_boxed(&self) -> BoxFuture<'_, Result<Vec<DurableExecutionState>, RepositoryError>>;

    fn delete_state_boxed<'a>(
        &'a self,
        task_instance_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<bool, RepositoryError>>;
}

impl<T: DurableLogRepository> DurableLogRepositoryDyn for T {
    fn load_state_boxed<'a>(
        &'a self,
        task_instance_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Option<DurableExecutionState>, RepositoryError>> {
        Box::pin(self.load_state(task_instance_id))
    }

    fn save_state_boxed<'a>(
        &'a self,
        state: &'a DurableExecutionState,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.save_state(state))
    }

    fn list_states_boxed(&self) -> BoxFuture<'_, Result<Vec<DurableExecutionState>, RepositoryError>> {
        Box::pin(self.list_states())
    }

    fn delete_state_boxed<'a>(
        &'a self,
        task_instance_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<bool, RepositoryError>> {
        Box::pin(self.delete_state(task_instance_id))
    }
}

/// Type-erased durable log repository. Cheap to clone.
#[derive(Clone)]
pub struct BoxDurableLogRepository {
    inner: Arc<dyn DurableLogRepositoryDyn + Send + Sync>,
}

impl BoxDurableLogRepository {
    pub fn new<T: DurableLogRepository + 'static>(repository: T) -> Self {
        Self {
            inner: Arc::new(repository),
        }
    }

    pub async fn load_state(
        &self,
        task_instance_id: &Uuid,
    ) -> Result<Option<DurableExecutionState>, RepositoryError> {
        self.inner.load_state_boxed(task_instance_id).await
    }

    pub async fn save_state(&self, state: &DurableExecutionState) -> Result<(), RepositoryError> {
        self.inner.save_state_boxed(state).await
    }

    pub async fn list_states(&self) -> Result<Vec<DurableExecutionState>, RepositoryError> {
        self.inner.list_states_boxed().await
    }

    pub async fn delete_state(&self, task_instance_id: &Uuid) -> Result<bool, RepositoryError> {
        self.inner.delete_state_boxed(task_instance_id).await
    }
}
