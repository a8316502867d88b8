//! Fleet Autoscaler CLI
//!
//! A command-line tool for inspecting a running fleet autoscaler: its status
//! summary, in-progress drains and component health.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use autoscaler_lib::DrainState;
use clap::{Parser, Subcommand};
use commands::{drains, health, status};

/// Fleet Autoscaler CLI
#[derive(Parser)]
#[command(name = "fas")]
#[command(author, version, about = "CLI for the Fleet Autoscaler", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FAS_API_URL env var)
    #[arg(long, env = "FAS_API_URL")]
    pub api_url: Option<String>,

    /// Output format (defaults to the config file's, then table)
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the latest status summary
    Status,

    /// List nodes being drained
    Drains {
        /// Only show drains in this state (cordoned, evicting, drained, terminating, terminated, failed)
        #[arg(long, short, value_parser = parse_drain_state)]
        state: Option<DrainState>,
    },

    /// Show component health and readiness
    Health,
}

fn parse_drain_state(value: &str) -> Result<DrainState, String> {
    DrainState::ALL
        .into_iter()
        .find(|state| state.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown drain state '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let api_url = config.resolve_api_url(cli.api_url.as_deref());
    let format = cli
        .format
        .or_else(|| config.default_format.as_deref().and_then(output::OutputFormat::parse))
        .unwrap_or_default();

    if cli.verbose {
        eprintln!("Using API at {}", api_url);
    }

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    // Execute command
    match cli.command {
        Commands::Status => status::show_status(&client, format).await?,
        Commands::Drains { state } => drains::list_drains(&client, state, format).await?,
        Commands::Health => health::show_health(&client, format).await?,
    }

    Ok(())
}
