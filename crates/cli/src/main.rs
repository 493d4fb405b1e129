//! API Sentinel CLI
//!
//! Lists active alerts, drives their lifecycle (acknowledge, resolve,
//! snooze) and shows the alert summary of a running sentinel daemon.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    alerts::{self, Action},
    summary,
};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_ACTOR: &str = "cli-user";

/// API Sentinel CLI
#[derive(Parser)]
#[command(name = "sentinelctl")]
#[command(author, version, about = "CLI for API Sentinel", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via SENTINEL_API_URL env var)
    #[arg(long, env = "SENTINEL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List and manage alerts
    #[command(subcommand)]
    Alerts(AlertsCommands),

    /// Show the alert summary
    Summary {
        /// Filter by API id
        #[arg(long)]
        api: Option<String>,

        /// Filter by environment (on-premises, aws, azure, gcp, other)
        #[arg(long, short)]
        env: Option<String>,
    },

    /// Manage the local CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum AlertsCommands {
    /// List active alerts
    List {
        /// Filter by API id
        #[arg(long)]
        api: Option<String>,

        /// Filter by environment (on-premises, aws, azure, gcp, other)
        #[arg(long, short)]
        env: Option<String>,
    },

    /// Acknowledge an alert
    Ack {
        /// Alert ID
        id: String,

        /// Actor recorded on the alert
        #[arg(long)]
        actor: Option<String>,
    },

    /// Resolve an alert
    Resolve {
        /// Alert ID
        id: String,

        /// Actor recorded on the alert
        #[arg(long)]
        actor: Option<String>,
    },

    /// Snooze an alert
    Snooze {
        /// Alert ID
        id: String,

        /// Snooze duration in minutes
        #[arg(long, short, default_value_t = 60)]
        minutes: i64,

        /// Actor recorded on the alert
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the stored configuration
    Show,

    /// Store defaults used when flags are omitted
    Set {
        /// Sentinel API URL
        #[arg(long)]
        api_url: Option<String>,

        /// Actor name for lifecycle operations
        #[arg(long)]
        actor: Option<String>,

        /// Default output format
        #[arg(long)]
        format: Option<OutputFormat>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stored = config::Config::load()?;

    let format = cli
        .format
        .or_else(|| stored.default_format.as_deref().and_then(OutputFormat::from_name))
        .unwrap_or_default();

    match cli.command {
        Commands::Config(cmd) => run_config(cmd, stored, format),
        command => {
            let api_url = cli
                .api_url
                .or_else(|| stored.api_url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string());
            let client = client::ApiClient::new(&api_url)?;
            let actor = stored.actor.as_deref().unwrap_or(DEFAULT_ACTOR);
            run_remote(&client, command, actor, format).await
        }
    }
}

async fn run_remote(
    client: &client::ApiClient,
    command: Commands,
    default_actor: &str,
    format: OutputFormat,
) -> Result<()> {
    let actor = |flag: Option<String>| flag.unwrap_or_else(|| default_actor.to_string());

    match command {
        Commands::Alerts(cmd) => match cmd {
            AlertsCommands::List { api, env } => {
                alerts::list_alerts(client, api, env, format).await?;
            }
            AlertsCommands::Ack { id, actor: who } => {
                alerts::update_alert(client, &id, Action::Acknowledge, &actor(who), format).await?;
            }
            AlertsCommands::Resolve { id, actor: who } => {
                alerts::update_alert(client, &id, Action::Resolve, &actor(who), format).await?;
            }
            AlertsCommands::Snooze { id, minutes, actor: who } => {
                alerts::update_alert(client, &id, Action::Snooze { minutes }, &actor(who), format)
                    .await?;
            }
        },
        Commands::Summary { api, env } => {
            summary::show_summary(client, api, env, format).await?;
        }
        Commands::Config(cmd) => run_config(cmd, config::Config::load()?, format)?,
    }

    Ok(())
}

fn run_config(cmd: ConfigCommands, mut stored: config::Config, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Json => output::print_json(&stored)?,
            OutputFormat::Table => {
                output::print_info(&format!("Config file: {}", config::Config::config_path()?.display()));
                println!("  api_url:        {}", stored.api_url.as_deref().unwrap_or(DEFAULT_API_URL));
                println!("  actor:          {}", stored.actor.as_deref().unwrap_or(DEFAULT_ACTOR));
                println!("  default_format: {}", stored.default_format.as_deref().unwrap_or("table"));
            }
        },
        ConfigCommands::Set { api_url, actor, format } => {
            if api_url.is_none() && actor.is_none() && format.is_none() {
                output::print_warning("Nothing to set");
                return Ok(());
            }
            if let Some(url) = api_url {
                client::ApiClient::new(&url)?;
                stored.api_url = Some(url);
            }
            if actor.is_some() {
                stored.actor = actor;
            }
            if let Some(format) = format {
                stored.default_format = Some(format!("{format:?}").to_lowercase());
            }
            let path = stored.save()?;
            output::print_success(&format!("Saved configuration to {}", path.display()));
        }
    }
    Ok(())
}
