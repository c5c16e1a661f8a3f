//! In-memory durable log repository.
//!
//! Keeps state only for the lifetime of the process. Used by tests and by
//! workers that do not need replay across restarts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use taskloom_core::repository::durable::DurableLogRepository;
use taskloom_types::durable::DurableExecutionState;
use taskloom_types::error::RepositoryError;
use uuid::Uuid;

use crate::suspend_log::{LogChange, plan_changes};

#[derive(Debug, Default)]
pub struct InMemoryDurableLogRepository {
    states: DashMap<Uuid, (DurableExecutionState, DateTime<Utc>)>,
}

impl InMemoryDurableLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl DurableLogRepository for InMemoryDurableLogRepository {
    async fn load_state(
        &self,
        task_instance_id: &Uuid,
    ) -> Result<Option<DurableExecutionState>, RepositoryError> {
        Ok(self.states.get(task_instance_id).map(|s| s.value().0.clone()))
    }

    async fn save_state(&self, state: &DurableExecutionState) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let mut slot = self
            .states
            .entry(state.task_instance_id)
            .or_insert_with(|| (DurableExecutionState::new(state.task_instance_id), now));
        let (stored, updated_at) = slot.value_mut();

        let changes = plan_changes(&stored.suspend_log, &state.suspend_log)?;
        for change in changes {
            match change {
                LogChange::Append(entry) => stored.suspend_log.push(entry.clone()),
                LogChange::Resolve(entry) => {
                    if let Some(existing) = stored
                        .suspend_log
                        .get_mut((entry.sequence - 1) as usize)
                    {
                        existing.outcome = entry.outcome.clone();
                    }
                }
            }
        }
        stored.sequence_cursor = state.sequence_cursor;
        stored.status = state.status;
        *updated_at = now;
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<DurableExecutionState>, RepositoryError> {
        let mut states: Vec<(DurableExecutionState, DateTime<Utc>)> =
            self.states.iter().map(|s| s.value().clone()).collect();
        states.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(states.into_iter().map(|(state, _)| state).collect())
    }

    async fn delete_state(&self, task_instance_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.states.remove(task_instance_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskloom_types::condition::Condition;
    use taskloom_types::durable::{DurableStatus, SuspendLogEntry};

    fn suspended(id: Uuid, fingerprint: &str) -> DurableExecutionState {
        let mut state = DurableExecutionState::new(id);
        state.status = DurableStatus::Suspended { sequence: 1 };
        state.sequence_cursor = 1;
        state.suspend_log.push(SuspendLogEntry {
            sequence: 1,
            condition: Condition::sleep(Duration::from_secs(1)),
            fingerprint: fingerprint.into(),
            anchored_at: Utc::now(),
            deadline: None,
            outcome: None,
        });
        state
    }

    #[tokio::test]
    async fn save_and_load() {
        let repo = InMemoryDurableLogRepository::new();
        let id = Uuid::now_v7();
        let state = suspended(id, "fp");
        repo.save_state(&state).await.unwrap();
        assert_eq!(repo.load_state(&id).await.unwrap(), Some(state));
        assert!(repo.load_state(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shorter_log_does_not_drop_entries() {
        let repo = InMemoryDurableLogRepository::new();
        let id = Uuid::now_v7();
        repo.save_state(&suspended(id, "fp")).await.unwrap();

        let mut restarted = DurableExecutionState::new(id);
        restarted.status = DurableStatus::Running;
        repo.save_state(&restarted).await.unwrap();

        let loaded = repo.load_state(&id).await.unwrap().unwrap();
        assert_eq!(loaded.suspend_log.len(), 1);
        assert_eq!(loaded.status, DurableStatus::Running);
        assert_eq!(loaded.sequence_cursor, 0);
    }

    #[tokio::test]
    async fn conflicting_entry_is_rejected() {
        let repo = InMemoryDurableLogRepository::new();
        let id = Uuid::now_v7();
        repo.save_state(&suspended(id, "fp")).await.unwrap();
        assert!(matches!(
            repo.save_state(&suspended(id, "other")).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let repo = InMemoryDurableLogRepository::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        repo.save_state(&DurableExecutionState::new(first)).await.unwrap();
        repo.save_state(&DurableExecutionState::new(second)).await.unwrap();
        assert_eq!(repo.list_states().await.unwrap().len(), 2);

        assert!(repo.delete_state(&first).await.unwrap());
        assert!(!repo.delete_state(&first).await.unwrap());
        assert_eq!(repo.len(), 1);
    }
}
