//! Durable execution: replay-safe suspension and resumption of tasks.
//!
//! - `replay` -- append-only, sequence-numbered suspend log and state machine
//! - `context` -- `DurableContext`, the per-instance `sleep_for` / `wait_for`
//!   implementation that drives the log against the engine
//! - `budget` -- execution-timeout clock that stops while a task is suspended

pub mod budget;
pub mod context;
pub mod replay;

pub use budget::ExecutionBudget;
pub use context::{DurableContext, SleepResult};
pub use replay::ReplayLog;

use taskloom_types::durable::DurableStatus;
use taskloom_types::error::RepositoryError;

use crate::engine::EngineError;

/// Errors raised by the durable execution layer.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// A replayed suspension point asked for a different condition than the
    /// one recorded at this sequence. The handler is not deterministic.
    #[error("replay mismatch at sequence {sequence}: recorded {recorded}, requested {requested}")]
    ReplayMismatch {
        sequence: u64,
        recorded: String,
        requested: String,
    },

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("unknown sequence {0}")]
    UnknownSequence(u64),

    #[error("conflicting outcome for sequence {0}")]
    OutcomeConflict(u64),

    #[error("invalid durable transition from {from} to {to}")]
    InvalidTransition { from: DurableStatus, to: DurableStatus },

    #[error("task instance cancelled")]
    Cancelled,

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}
