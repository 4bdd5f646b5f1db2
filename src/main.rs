mod channel;
mod cli;
mod clock;
mod config;
mod daemon;
mod db;
mod director;
mod emitter;
mod engine;
mod error;
mod horizon;
mod models;
mod plan_store;
mod reconcile;
mod resolve;
mod server;
mod spool;
mod translog;
mod transport;
mod window;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::{load_config, validate_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.core.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Resolve { channel, date, output }) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            plan_store::sync_config_to_db(&pool, &config)
                .await
                .context("syncing config to database")?;

            let channel_config = config
                .channel
                .iter()
                .find(|c| c.slug == channel)
                .ok_or_else(|| anyhow::anyhow!("no channel with slug '{channel}'"))?;
            let id = plan_store::channel_id_by_slug(&pool, &channel)
                .await?
                .ok_or_else(|| anyhow::anyhow!("channel '{channel}' missing after sync"))?;
            let runtime = daemon::build_channel_runtime(&config, channel_config, id)?;

            let date = match date {
                Some(ref s) => s
                    .parse()
                    .with_context(|| format!("invalid --date '{s}': expected YYYY-MM-DD"))?,
                None => chrono::Utc::now().with_timezone(&runtime.timezone).date_naive(),
            };

            let day = resolve::build_resolved_day(&pool, &runtime, date)
                .await
                .context("resolving broadcast day")?;
            let json = serde_json::to_string_pretty(&day).context("serializing lineup")?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &json).with_context(|| format!("writing lineup to {}", path.display()))?;
                    println!("Lineup written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}
