//! Taskloom command-line entry point.
//!
//! Binary name: `tloom`
//!
//! Inspects workflow definition files, previews retry and condition
//! policies, and manages the durable state stored by workers.

mod cli;

use clap::Parser;
use taskloom_observe::{LogFormat, TracingOptions};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,taskloom=debug",
        _ => "trace",
    };
    let format = if cli.json { LogFormat::Json } else { LogFormat::Text };
    taskloom_observe::init_tracing(
        &TracingOptions::default()
            .format(format)
            .default_directive(directive),
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Workflow { action } => cli::workflow::handle_workflow_command(action, cli.json),
        Commands::Backoff(args) => cli::policy::handle_backoff(args, cli.json),
        Commands::Condition { action } => cli::policy::handle_condition_command(action, cli.json),
        Commands::Durable { action } => {
            cli::durable::handle_durable_command(action, cli.database.as_deref(), cli.json).await
        }
        Commands::Config { path } => cli::config::handle_config(path, cli.json).await,
    };

    taskloom_observe::shutdown_tracing();
    result
}
