use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dap_sync::{build_context, run_once_from_config, AppConfig, ArchivePipeline, ArchiveScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dap-cli")]
#[command(about = "Deal archive pipeline")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, env = "DAP_CONFIG", default_value = dap_sync::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive pending records on the configured interval until interrupted.
    Run,
    /// Run a single archive cycle and exit.
    Once {
        /// Print the full cycle summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print a redacted summary.
    CheckConfig,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = AppConfig::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Once { json } => {
            let summary = run_once_from_config(&config).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing cycle summary")?
                );
            } else {
                println!(
                    "cycle complete: cycle_id={} eligible={} archived={} errored={} stuck={}",
                    summary.cycle_id, summary.eligible, summary.archived, summary.errored, summary.stuck
                );
            }
        }
        Commands::CheckConfig => {
            println!("config ok: {}", cli.config.display());
            println!("{}", config.redacted_summary());
        }
    }

    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    let pipeline = Arc::new(ArchivePipeline::new(build_context(&config).await?));
    let scheduler = ArchiveScheduler::start(pipeline).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    if !scheduler.shutdown().await? {
        warn!("exiting with archive cycles still in flight; affected records may stay in archiving status");
    }
    Ok(())
}
