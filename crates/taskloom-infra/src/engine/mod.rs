//! Engine implementations.

pub mod local;
mod slots;

pub use local::LocalEngine;
