//! Workflow definition subcommands: validate, plan and list.
//!
//! These operate on YAML files only. Nothing is registered with an engine;
//! workers register their workflows at startup.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use taskloom_core::workflow::dag::build_execution_plan;
use taskloom_core::workflow::definition::{WorkflowError, discover_workflows, load_workflow_file};
use taskloom_types::workflow::{TaskSpec, WorkflowSpec};

use super::print_json;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Parse and validate a workflow YAML file.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Show the parallel execution waves of a workflow.
    Plan {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List every valid workflow file under a directory.
    List {
        /// Directory to search recursively.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

pub fn handle_workflow_command(cmd: WorkflowCommand, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Plan { file } => handle_plan(&file, json),
        WorkflowCommand::List { dir } => handle_list(&dir, json),
    }
}

fn load(file: &Path) -> Result<WorkflowSpec> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::IoError(err) => anyhow!("Failed to read {}: {err}", file.display()),
        other => anyhow!("Workflow validation failed: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let spec = load(file)?;

    if json {
        return print_json(&serde_json::json!({
            "name": spec.name,
            "version": spec.version,
            "tasks": spec.tasks.len(),
            "durable_tasks": spec.tasks.iter().filter(|t| t.durable).count(),
            "events": spec.triggers.events,
            "crons": spec.triggers.crons,
            "on_failure": spec.on_failure.as_ref().map(|t| t.name.clone()),
            "on_success": spec.on_success.as_ref().map(|t| t.name.clone()),
        }));
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&spec.name).cyan()
    );
    println!("  Version: {}", spec.version);
    println!("  Tasks: {}", spec.tasks.len());
    if !spec.triggers.is_empty() {
        println!(
            "  Triggers: {} event(s), {} cron(s)",
            spec.triggers.events.len(),
            spec.triggers.crons.len()
        );
    }
    if let Some(task) = &spec.on_failure {
        println!("  On failure: {}", task.name);
    }
    if let Some(task) = &spec.on_success {
        println!("  On success: {}", task.name);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

fn handle_plan(file: &Path, json: bool) -> Result<()> {
    let spec = load(file)?;
    let waves = build_execution_plan(&spec.tasks).map_err(|e| anyhow!("{e}"))?;

    if json {
        let waves: Vec<Vec<&str>> = waves
            .iter()
            .map(|wave| wave.iter().map(|t| t.name.as_str()).collect())
            .collect();
        return print_json(&serde_json::json!({ "name": spec.name, "waves": waves }));
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Wave").fg(Color::White),
            Cell::new("Task").fg(Color::White),
            Cell::new("Parents").fg(Color::White),
            Cell::new("Retries").fg(Color::White),
            Cell::new("Flags").fg(Color::White),
        ]);

    for (index, wave) in waves.iter().enumerate() {
        for task in wave {
            table.add_row(vec![
                Cell::new(index),
                Cell::new(&task.name).fg(Color::Cyan),
                Cell::new(task.parents.join(", ")),
                Cell::new(task.retry.max_retries),
                Cell::new(task_flags(task)),
            ]);
        }
    }

    println!();
    println!("  {}", style(&spec.name).bold());
    println!("{table}");
    println!();
    Ok(())
}

/// Short markers for the policies attached to a task.
fn task_flags(task: &TaskSpec) -> String {
    let mut flags = Vec::new();
    if task.durable {
        flags.push("durable");
    }
    if task.wait_for.is_some() {
        flags.push("wait_for");
    }
    if task.skip_if.is_some() {
        flags.push("skip_if");
    }
    if task.cancel_if.is_some() {
        flags.push("cancel_if");
    }
    if !task.concurrency.is_empty() {
        flags.push("concurrency");
    }
    if !task.rate_limits.is_empty() {
        flags.push("rate_limited");
    }
    flags.join(" ")
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn handle_list(dir: &Path, json: bool) -> Result<()> {
    let found = discover_workflows(dir).map_err(|e| anyhow!("Failed to scan {}: {e}", dir.display()))?;

    if json {
        let out: Vec<_> = found
            .iter()
            .map(|(path, spec)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "name": spec.name,
                    "version": spec.version,
                    "tasks": spec.tasks.len(),
                })
            })
            .collect();
        return print_json(&serde_json::Value::Array(out));
    }

    if found.is_empty() {
        println!();
        println!("  No workflows found under {}", dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::White),
            Cell::new("Version").fg(Color::White),
            Cell::new("Tasks").fg(Color::White),
            Cell::new("Path").fg(Color::White),
        ]);
    for (path, spec) in &found {
        table.add_row(vec![
            Cell::new(&spec.name).fg(Color::Cyan),
            Cell::new(&spec.version),
            Cell::new(spec.tasks.len()),
            Cell::new(path.display()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
