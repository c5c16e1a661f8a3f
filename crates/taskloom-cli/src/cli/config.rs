//! `tloom config`: print the worker configuration a worker would load.

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use taskloom_infra::config::{default_config_path, load_worker_config};

use super::print_json;

pub async fn handle_config(path: Option<PathBuf>, json: bool) -> Result<()> {
    let path = path.unwrap_or_else(default_config_path);
    let config = load_worker_config(&path).await;

    if json {
        return print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "exists": path.exists(),
            "config": serde_json::to_value(&config)?,
        }));
    }

    println!();
    if path.exists() {
        println!("  Config file: {}", style(path.display()).cyan());
    } else {
        println!(
            "  Config file: {} {}",
            style(path.display()).cyan(),
            style("(not found, using defaults)").dim()
        );
    }
    println!("  Name:             {}", config.name);
    println!("  Slots:            {}", config.slots);
    println!(
        "  Namespace:        {}",
        config.namespace.as_deref().unwrap_or("-")
    );
    println!("  Default priority: {:?}", config.default_priority);
    println!("  Shutdown grace:   {}s", config.shutdown_grace_secs);
    println!("  OpenTelemetry:    {}", if config.otel { "on" } else { "off" });
    println!();
    Ok(())
}
