//! Shared domain types for Taskloom.
//!
//! This crate contains the declarative shapes that flow between workflow
//! authors, the worker runtime and the orchestration engine: workflow and task
//! specs, wait-conditions, admission/retry policies, durable execution state
//! and run records.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod condition;
pub mod config;
pub mod duration;
pub mod durable;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
