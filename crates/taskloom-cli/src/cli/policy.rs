//! Policy preview subcommands: retry backoff schedules and wait-condition
//! fingerprints.

use anyhow::{Context, Result, anyhow};
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use taskloom_core::workflow::condition::{fingerprint, validate_condition};
use taskloom_core::workflow::definition::validate_task;
use taskloom_core::workflow::retry::RetryHandler;
use taskloom_types::condition::Condition;
use taskloom_types::duration::format_duration;
use taskloom_types::workflow::{BackoffPolicy, RetryPolicy, TaskSpec};

use super::print_json;

#[derive(Args)]
pub struct BackoffArgs {
    /// Retries after the first attempt.
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Growth factor between consecutive delays (>= 1.0).
    #[arg(long, default_value = "2.0")]
    pub factor: f64,

    /// Upper bound for a single delay, in seconds.
    #[arg(long, default_value = "60")]
    pub max_seconds: u64,

    /// Delay before the first retry, in seconds.
    #[arg(long, default_value = "1.0")]
    pub base_seconds: f64,
}

impl BackoffArgs {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::retries(self.retries).with_backoff(
            BackoffPolicy::new(self.factor, self.max_seconds).with_base_seconds(self.base_seconds),
        )
    }
}

#[derive(Subcommand)]
pub enum ConditionCommand {
    /// Print the SHA-256 fingerprint of a condition.
    Fingerprint {
        /// Condition in wire JSON, e.g. '{"type":"event","key":"order:paid"}'.
        condition: String,
    },

    /// Print the canonical JSON form of a condition.
    Canonical {
        /// Condition in wire JSON.
        condition: String,
    },
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

pub fn handle_backoff(args: BackoffArgs, json: bool) -> Result<()> {
    let mut spec = TaskSpec::new("backoff");
    spec.retry = args.policy();
    validate_task(&spec).map_err(|e| anyhow!("Invalid backoff policy: {e}"))?;

    let delays = RetryHandler::backoff_schedule(&spec.retry);

    if json {
        let out: Vec<_> = delays
            .iter()
            .enumerate()
            .map(|(i, d)| serde_json::json!({ "retry": i + 1, "delay_ms": d.as_millis() as u64 }))
            .collect();
        return print_json(&serde_json::Value::Array(out));
    }

    if delays.is_empty() {
        println!();
        println!("  No retries: the task runs once.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Retry").fg(Color::White),
            Cell::new("Delay").fg(Color::White),
            Cell::new("Capped").fg(Color::White),
        ]);
    for (index, delay) in delays.iter().enumerate() {
        let capped = delay.as_secs_f64() >= args.max_seconds as f64;
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(format_duration(*delay)).fg(Color::Cyan),
            Cell::new(if capped { "yes" } else { "" }),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

pub fn handle_condition_command(cmd: ConditionCommand, json: bool) -> Result<()> {
    match cmd {
        ConditionCommand::Fingerprint { condition } => {
            let condition = parse_condition(&condition)?;
            let digest = fingerprint(&condition);
            if json {
                return print_json(&serde_json::json!({
                    "fingerprint": digest,
                    "canonical": serde_json::to_value(condition.canonicalize())?,
                }));
            }
            println!("{digest}");
            Ok(())
        }
        ConditionCommand::Canonical { condition } => {
            let condition = parse_condition(&condition)?;
            if json {
                return print_json(&serde_json::to_value(condition.canonicalize())?);
            }
            println!("{}", condition.canonical_json());
            for leaf in condition.leaves() {
                if let Some(id) = leaf.readable_id() {
                    println!("  {} {}", style("-").dim(), id);
                }
            }
            Ok(())
        }
    }
}

fn parse_condition(raw: &str) -> Result<Condition> {
    let condition: Condition =
        serde_json::from_str(raw).context("Condition is not valid wire JSON")?;
    validate_condition(&condition).map_err(|e| anyhow!("Invalid condition: {e}"))?;
    Ok(condition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_order_does_not_change_the_fingerprint() {
        let a = parse_condition(
            r#"{"op":"OR","children":[{"type":"event","key":"a"},{"type":"sleep","duration":"10s"}]}"#,
        )
        .unwrap();
        let b = parse_condition(
            r#"{"op":"OR","children":[{"type":"sleep","duration":"10s"},{"type":"event","key":"a"}]}"#,
        )
        .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn malformed_condition_is_rejected() {
        assert!(parse_condition(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn backoff_below_one_is_rejected() {
        let args = BackoffArgs {
            retries: 2,
            factor: 0.5,
            max_seconds: 10,
            base_seconds: 1.0,
        };
        assert!(handle_backoff(args, true).is_err());
    }
}
