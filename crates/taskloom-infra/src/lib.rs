//! Infrastructure layer for Taskloom.
//!
//! Contains implementations of the ports defined in `taskloom-core`: the
//! SQLite and in-memory durable-log repositories, the in-process engine
//! used for development and tests, and the worker config loader.

pub mod config;
pub mod engine;
pub mod memory;
pub mod sqlite;
mod suspend_log;

pub use engine::LocalEngine;
pub use memory::InMemoryDurableLogRepository;
pub use sqlite::durable::SqliteDurableLogRepository;
pub use sqlite::pool::DatabasePool;
