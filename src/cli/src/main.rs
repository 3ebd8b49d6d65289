//! Tollgate CLI: inspect queues and jobs on a running `tollgate-server`.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, job, queues};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Tollgate - admission control and durable job queue
#[derive(Parser)]
#[command(
    name = "tollgate",
    version,
    about = "Tollgate job queue CLI",
    long_about = "Enqueue, inspect and remove jobs, and check queue health on a Tollgate server.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "TOLLGATE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server liveness
    Health,

    /// Per-queue job counts by state
    Queues,

    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// CLI configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = match cli.command {
        Commands::Health => health::execute(&connect(cli.api_url)?, format).await,
        Commands::Queues => queues::execute(&connect(cli.api_url)?, format).await,
        Commands::Job(cmd) => job::execute(cmd, &connect(cli.api_url)?, format).await,
        Commands::Config(cmd) => config::execute(cmd, format),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

/// Flag or env var first, then `~/.tollgate/config.toml`, then localhost.
fn connect(api_url: Option<String>) -> Result<client::ApiClient> {
    let url = api_url
        .or_else(config::load_api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    client::ApiClient::new(&url)
}
