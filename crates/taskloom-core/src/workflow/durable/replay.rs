//! Append-only replay log and the durable state machine.
//!
//! `ReplayLog` owns one instance's `DurableExecutionState`. Every suspension
//! point gets the next sequence number; on re-execution the handler walks
//! the same sequence again and the log hands back what was recorded.
//!
//! State machine:
//!
//! ```text
//! RUNNING --suspend--> SUSPENDED(n) --satisfied--> RESUMING(n) --injected--> RUNNING
//! RUNNING --return/throw--> COMPLETED | FAILED
//! any non-terminal --cancel--> CANCELLED
//! ```
//!
//! Terminal states are absorbing.

use taskloom_types::durable::{DurableExecutionState, DurableStatus, SuspendLogEntry, SuspendOutcome};
use uuid::Uuid;

use super::DurableError;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayLog {
    state: DurableExecutionState,
}

impl ReplayLog {
    /// Fresh log for a new instance.
    pub fn new(task_instance_id: Uuid) -> Self {
        Self {
            state: DurableExecutionState::new(task_instance_id),
        }
    }

    /// Resume from persisted state for a new execution pass: the cursor is
    /// rewound so the handler replays from its first suspension point.
    pub fn resume(mut state: DurableExecutionState) -> Self {
        state.sequence_cursor = 0;
        Self { state }
    }

    pub fn state(&self) -> &DurableExecutionState {
        &self.state
    }

    pub fn into_state(self) -> DurableExecutionState {
        self.state
    }

    pub fn status(&self) -> DurableStatus {
        self.state.status
    }

    pub fn cursor(&self) -> u64 {
        self.state.sequence_cursor
    }

    pub fn len(&self) -> usize {
        self.state.suspend_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.suspend_log.is_empty()
    }

    /// Move the cursor to the next suspension point and return its number.
    pub fn advance(&mut self) -> u64 {
        self.state.sequence_cursor += 1;
        self.state.sequence_cursor
    }

    pub fn entry(&self, sequence: u64) -> Option<&SuspendLogEntry> {
        // Sequences are dense from 1, so the index is sequence - 1.
        let idx = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.state
            .suspend_log
            .get(idx)
            .filter(|e| e.sequence == sequence)
    }

    /// Append a new entry. Its sequence must be exactly one past the last.
    pub fn append(&mut self, entry: SuspendLogEntry) -> Result<(), DurableError> {
        let expected = self.state.last_sequence() + 1;
        if entry.sequence != expected {
            return Err(DurableError::SequenceGap {
                expected,
                got: entry.sequence,
            });
        }
        self.state.suspend_log.push(entry);
        Ok(())
    }

    /// Record the outcome of `sequence`.
    ///
    /// Returns `Ok(false)` when an equal outcome is already recorded.
    pub fn record_outcome(
        &mut self,
        sequence: u64,
        outcome: SuspendOutcome,
    ) -> Result<bool, DurableError> {
        let idx = sequence
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < self.state.suspend_log.len())
            .ok_or(DurableError::UnknownSequence(sequence))?;
        let entry = &mut self.state.suspend_log[idx];
        match &entry.outcome {
            Some(existing) if *existing == outcome => Ok(false),
            Some(_) => Err(DurableError::OutcomeConflict(sequence)),
            None => {
                entry.outcome = Some(outcome);
                Ok(true)
            }
        }
    }

    /// Apply a state transition, rejecting anything the machine forbids.
    pub fn transition(&mut self, to: DurableStatus) -> Result<(), DurableError> {
        let from = self.state.status;
        if !Self::allowed(from, to) {
            return Err(DurableError::InvalidTransition { from, to });
        }
        tracing::debug!(
            instance = %self.state.task_instance_id,
            %from,
            %to,
            "durable transition"
        );
        self.state.status = to;
        Ok(())
    }

    fn allowed(from: DurableStatus, to: DurableStatus) -> bool {
        use DurableStatus::*;
        if from.is_terminal() {
            return false;
        }
        match (from, to) {
            (_, Cancelled) => true,
            (Running, Suspended { .. }) => true,
            (Suspended { sequence: a }, Resuming { sequence: b }) => a == b,
            (Resuming { .. }, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }
}
