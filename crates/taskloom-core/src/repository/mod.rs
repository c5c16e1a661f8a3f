//! Repository trait definitions (ports) implemented by taskloom-infra.

pub mod durable;

pub use durable::{BoxDurableLogRepository, DurableLogRepository};
