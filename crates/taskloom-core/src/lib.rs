//! Workflow declaration and durable execution runtime for Taskloom.
//!
//! This crate defines the ports the orchestration engine and the durable log
//! store implement (`engine`, `repository`) and everything that runs on the
//! worker side of them: workflow registration, admission and priority
//! resolution, retry decisions and the durable execution context. It depends
//! only on `taskloom-types` -- never on `taskloom-infra` or any database/IO
//! crate.

pub mod clock;
pub mod context;
pub mod engine;
pub mod event;
pub mod handler;
pub mod repository;
pub mod worker;
pub mod workflow;

pub use context::TaskContext;
pub use handler::{BoxTaskHandler, TaskError, TaskHandler, handler_fn};
pub use worker::{RunOptions, Worker, WorkerError};
pub use workflow::builder::{TaskDefinition, TaskHandle, Workflow, WorkflowBuilder};
