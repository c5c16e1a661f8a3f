//! CLI command definitions for the `tloom` binary.
//!
//! Uses clap derive macros. Commands follow a noun-verb pattern
//! (`tloom workflow validate`, `tloom durable list`).

pub mod config;
pub mod durable;
pub mod policy;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect Taskloom workflows and durable task state.
#[derive(Parser)]
#[command(name = "tloom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// SQLite URL of the durable store (defaults to the data directory).
    #[arg(long, global = true, env = "TASKLOOM_DATABASE_URL")]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Workflow definition files (validate, plan, print).
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Print the retry delays a backoff policy produces.
    Backoff(policy::BackoffArgs),

    /// Wait-condition tools (fingerprint, canonical form).
    Condition {
        #[command(subcommand)]
        action: policy::ConditionCommand,
    },

    /// Durable task state stored by workers (list, show, delete).
    Durable {
        #[command(subcommand)]
        action: durable::DurableCommand,
    },

    /// Show the effective worker configuration.
    Config {
        /// Path to taskloom.toml (defaults to the data directory).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

pub(crate) fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
