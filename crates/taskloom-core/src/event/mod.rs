//! Worker event distribution.

pub mod bus;

pub use bus::{EventBus, RunEvents};
