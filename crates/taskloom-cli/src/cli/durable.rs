//! Durable state subcommands: list, show and delete stored instances.

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use taskloom_core::repository::durable::DurableLogRepository;
use taskloom_infra::sqlite::pool::{DatabasePool, default_database_url};
use taskloom_infra::SqliteDurableLogRepository;
use taskloom_types::durable::{DurableExecutionState, DurableStatus, SuspendLogEntry};

use super::print_json;

#[derive(Subcommand)]
pub enum DurableCommand {
    /// List stored durable task instances.
    List {
        /// Only show instances that are not yet terminal.
        #[arg(long)]
        active: bool,
    },

    /// Show the suspend log of one instance.
    Show {
        /// Task instance UUID.
        id: String,
    },

    /// Delete the stored state of one instance.
    Delete {
        /// Task instance UUID.
        id: String,

        /// Delete even if the instance is not terminal.
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_durable_command(
    cmd: DurableCommand,
    database: Option<&str>,
    json: bool,
) -> Result<()> {
    let url = database.map(str::to_string).unwrap_or_else(default_database_url);
    tracing::debug!(url = %url, "opening durable store");
    let pool = match database {
        Some(url) => DatabasePool::new(url).await,
        None => DatabasePool::open_default().await,
    }
    .with_context(|| format!("Failed to open durable store at {url}"))?;
    let repo = SqliteDurableLogRepository::new(pool.clone());

    let result = match cmd {
        DurableCommand::List { active } => handle_list(&repo, active, json).await,
        DurableCommand::Show { id } => handle_show(&repo, &parse_id(&id)?, json).await,
        DurableCommand::Delete { id, force } => {
            handle_delete(&repo, &parse_id(&id)?, force, json).await
        }
    };
    pool.close().await;
    result
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid task instance ID: {raw}"))
}

fn status_color(status: &DurableStatus) -> Color {
    match status {
        DurableStatus::Running | DurableStatus::Resuming { .. } => Color::Cyan,
        DurableStatus::Suspended { .. } => Color::Yellow,
        DurableStatus::Completed => Color::Green,
        DurableStatus::Failed => Color::Red,
        DurableStatus::Cancelled => Color::DarkGrey,
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    repo: &impl DurableLogRepository,
    active_only: bool,
    json: bool,
) -> Result<()> {
    let states: Vec<DurableExecutionState> = repo
        .list_states()
        .await
        .map_err(|e| anyhow!("Failed to list durable states: {e}"))?
        .into_iter()
        .filter(|s| !active_only || !s.status.is_terminal())
        .collect();

    if json {
        return print_json(&serde_json::to_value(&states)?);
    }

    if states.is_empty() {
        println!();
        println!("  No durable task instances stored.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Cursor").fg(Color::White),
            Cell::new("Suspensions").fg(Color::White),
            Cell::new("Unresolved").fg(Color::White),
        ]);
    for state in &states {
        let unresolved = state.suspend_log.iter().filter(|e| !e.is_resolved()).count();
        table.add_row(vec![
            Cell::new(state.task_instance_id),
            Cell::new(state.status).fg(status_color(&state.status)),
            Cell::new(state.sequence_cursor),
            Cell::new(state.suspend_log.len()),
            Cell::new(unresolved),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(repo: &impl DurableLogRepository, id: &Uuid, json: bool) -> Result<()> {
    let state = repo
        .load_state(id)
        .await
        .map_err(|e| anyhow!("Failed to load durable state: {e}"))?
        .ok_or_else(|| anyhow!("Durable task instance '{id}' not found"))?;

    if json {
        return print_json(&serde_json::to_value(&state)?);
    }

    println!();
    println!("  Instance: {}", style(state.task_instance_id).cyan());
    println!("  Status:   {}", state.status);
    println!("  Cursor:   {}", state.sequence_cursor);
    println!();

    if state.suspend_log.is_empty() {
        println!("  No suspension points recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::White),
            Cell::new("Condition").fg(Color::White),
            Cell::new("Anchored").fg(Color::White),
            Cell::new("Resolved").fg(Color::White),
        ]);
    for entry in &state.suspend_log {
        table.add_row(log_row(entry));
    }
    println!("{table}");
    println!();
    Ok(())
}

fn log_row(entry: &SuspendLogEntry) -> Vec<Cell> {
    let condition = entry
        .condition
        .leaves()
        .iter()
        .filter_map(|leaf| leaf.readable_id())
        .collect::<Vec<_>>()
        .join(", ");
    let resolved = match &entry.outcome {
        Some(outcome) => Cell::new(outcome.resolved_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::Green),
        None => Cell::new("pending").fg(Color::Yellow),
    };
    vec![
        Cell::new(entry.sequence),
        Cell::new(condition),
        Cell::new(entry.anchored_at.format("%Y-%m-%d %H:%M:%S")),
        resolved,
    ]
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(
    repo: &impl DurableLogRepository,
    id: &Uuid,
    force: bool,
    json: bool,
) -> Result<()> {
    if !force {
        if let Some(state) = repo
            .load_state(id)
            .await
            .map_err(|e| anyhow!("Failed to load durable state: {e}"))?
        {
            if !state.status.is_terminal() {
                bail!(
                    "Instance '{id}' is {} and may still be replayed; pass --force to delete it",
                    state.status
                );
            }
        }
    }

    let deleted = repo
        .delete_state(id)
        .await
        .map_err(|e| anyhow!("Failed to delete durable state: {e}"))?;

    if json {
        return print_json(&serde_json::json!({ "id": id.to_string(), "deleted": deleted }));
    }
    if deleted {
        println!("  {} Deleted instance {}", style("*").green().bold(), id);
    } else {
        println!("  Instance {id} was not stored");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskloom_infra::InMemoryDurableLogRepository;
    use taskloom_types::condition::Condition;

    fn suspended_state(id: Uuid) -> DurableExecutionState {
        let mut state = DurableExecutionState::new(id);
        state.sequence_cursor = 1;
        state.status = DurableStatus::Suspended { sequence: 1 };
        state.suspend_log.push(SuspendLogEntry {
            sequence: 1,
            condition: Condition::event("order:paid"),
            fingerprint: "f".into(),
            anchored_at: Utc::now(),
            deadline: None,
            outcome: None,
        });
        state
    }

    #[tokio::test]
    async fn delete_refuses_live_instances_without_force() {
        let repo = InMemoryDurableLogRepository::new();
        let id = Uuid::now_v7();
        repo.save_state(&suspended_state(id)).await.unwrap();

        assert!(handle_delete(&repo, &id, false, true).await.is_err());
        assert!(repo.load_state(&id).await.unwrap().is_some());

        handle_delete(&repo, &id, true, true).await.unwrap();
        assert!(repo.load_state(&id).await.unwrap().is_none());
    }

    #[test]
    fn log_row_names_condition_leaves() {
        let row = log_row(&suspended_state(Uuid::now_v7()).suspend_log[0]);
        assert_eq!(row.len(), 4);
        assert_eq!(row[1].content(), "event:order:paid");
        assert_eq!(row[3].content(), "pending");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(parse_id("not-a-uuid").is_err());
    }
}
