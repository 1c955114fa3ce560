use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recon_sync::{SyncConfig, SyncPipeline};
use tracing::{error, info};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Reconcile stored records against the external lookup service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass (default).
    Sync,
    /// Start the HTTP trigger.
    Serve,
    /// Run passes on the configured cron schedule until interrupted.
    Schedule,
    /// Validate configuration and field mappings against the live schema.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            logging::init(false);
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.debug);

    match run(cli.command.unwrap_or(Commands::Sync), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: SyncConfig) -> Result<()> {
    match command {
        Commands::Sync => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} environment={} records={} batches={} report={}",
                summary.run_id, summary.environment, summary.total_records, summary.batches, summary.report_path
            );
        }
        Commands::Serve => recon_web::serve(config).await?,
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler was not built");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Check => {
            let check = SyncPipeline::new(config)?.check().await?;
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
    }
    Ok(())
}
