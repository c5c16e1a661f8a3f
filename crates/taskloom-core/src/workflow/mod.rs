//! Workflow declaration and policy core.
//!
//! - `builder` -- programmatic workflow/task registration
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- cycle detection, topological order, parallel waves
//! - `condition` -- wait-condition evaluation, fingerprints, task gates
//! - `admission` -- concurrency group keys and rate-limit bucket requests
//! - `priority` -- effective priority resolution
//! - `retry` -- retry decisions and backoff delays
//! - `expression` -- JEXL evaluator shared by the policies above
//! - `durable` -- replay log and durable execution context

pub mod admission;
pub mod builder;
pub mod condition;
pub mod dag;
pub mod definition;
pub mod durable;
pub mod expression;
pub mod priority;
pub mod retry;
