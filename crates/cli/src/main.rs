//! Agent Usage Governor CLI
//!
//! A command-line tool for inspecting budget consumption, anomalies and
//! effective policies, and for driving policy syncs.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{anomalies, budgets, policies};

/// Agent Usage Governor CLI
#[derive(Parser)]
#[command(name = "agov")]
#[command(author, version, about = "CLI for the Agent Usage Governor", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via AGOV_API_URL env var)
    #[arg(long, env = "AGOV_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect budget consumption
    #[command(subcommand)]
    Budgets(BudgetsCommands),

    /// Inspect detected anomalies
    #[command(subcommand)]
    Anomalies(AnomaliesCommands),

    /// Inspect and sync policies
    #[command(subcommand)]
    Policies(PoliciesCommands),
}

#[derive(Subcommand)]
pub enum BudgetsCommands {
    /// Show budget status for an agent's metric
    Status {
        /// Agent id
        agent: String,

        /// Metric kind (tokens, cost, calls, duration_ms)
        #[arg(long, short, default_value = "tokens")]
        metric: String,
    },
}

#[derive(Subcommand)]
pub enum AnomaliesCommands {
    /// List anomalies over a detection window
    List {
        /// Aggregation window in seconds (server default when omitted)
        #[arg(long)]
        window_secs: Option<u64>,
    },

    /// Drill into one agent's metric series
    Spikes {
        /// Agent id
        agent: String,

        /// Metric kind (tokens, cost, calls, duration_ms)
        #[arg(long, short, default_value = "tokens")]
        metric: String,

        /// How far back to analyze, in hours
        #[arg(long, default_value = "24")]
        since_hours: u64,
    },
}

#[derive(Subcommand)]
pub enum PoliciesCommands {
    /// Show the resolved effective policy for an agent
    Effective {
        /// Agent id
        agent: String,
    },

    /// Recompute effective policies and apply the diff
    Sync {
        /// Compute the diff without committing it
        #[arg(long)]
        dry_run: bool,

        /// Restrict the sync to one scope level (org, project, agent)
        #[arg(long)]
        scope: Option<String>,

        /// Scope id the restriction applies to
        #[arg(long)]
        scope_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize client
    let client = client::ApiClient::new(&cli.api_url)?;

    // Execute command
    match cli.command {
        Commands::Budgets(cmd) => match cmd {
            BudgetsCommands::Status { agent, metric } => {
                budgets::status(&client, &agent, &metric, cli.format).await?;
            }
        },
        Commands::Anomalies(cmd) => match cmd {
            AnomaliesCommands::List { window_secs } => {
                anomalies::list(&client, window_secs, cli.format).await?;
            }
            AnomaliesCommands::Spikes {
                agent,
                metric,
                since_hours,
            } => {
                anomalies::spikes(&client, &agent, &metric, since_hours, cli.format).await?;
            }
        },
        Commands::Policies(cmd) => match cmd {
            PoliciesCommands::Effective { agent } => {
                policies::effective(&client, &agent, cli.format).await?;
            }
            PoliciesCommands::Sync {
                dry_run,
                scope,
                scope_id,
            } => {
                policies::sync(&client, dry_run, scope, scope_id, cli.format).await?;
            }
        },
    }

    Ok(())
}
