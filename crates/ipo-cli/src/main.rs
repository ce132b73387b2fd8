use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipo_storage::RecordStore;
use ipo_sync::{
    build_pipeline, connect_database, maybe_build_cron_scheduler, run_sync_once_from_env, Scheduler,
    SyncConfig,
};
use ipo_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ipo-cli")]
#[command(about = "IPO Watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print its summary.
    Sync,
    /// Serve the read API with the background scheduler.
    Serve,
    /// Run the background scheduler only, until Ctrl-C.
    Schedule,
    /// Print every stored offering.
    List,
    /// Delete every stored offering.
    Clear,
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ipo_sync=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let result = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} saved={} new={} cache={:?} notify={:?}",
                result.run_id,
                result.fetched,
                result.saved_offerings.len(),
                result.new_offerings.len(),
                result.stages.cache,
                result.stages.notify
            );
        }
        Commands::Serve => {
            let pipeline = build_pipeline(&config).await?;
            let scheduler = if config.scheduler_enabled {
                Some(Scheduler::new(pipeline.clone(), config.cycle_request(), config.sync_interval())?.start())
            } else {
                info!("IPO_SCHEDULER_ENABLED is off; syncing only on demand");
                None
            };
            let mut cron = maybe_build_cron_scheduler(&config, pipeline.clone()).await?;
            if let Some(cron) = &cron {
                cron.start().await.context("starting cron scheduler")?;
            }

            let state = AppState::new(pipeline, config.cycle_request()).with_admin_token(config.admin_token.clone());
            ipo_web::serve(state, config.web_port, shutdown_signal()).await?;

            if let Some(handle) = scheduler {
                handle.stop().await;
            }
            if let Some(cron) = cron.as_mut() {
                cron.shutdown().await.context("stopping cron scheduler")?;
            }
        }
        Commands::Schedule => {
            let pipeline = build_pipeline(&config).await?;
            let handle = Scheduler::new(pipeline, config.cycle_request(), config.sync_interval())?.start();
            shutdown_signal().await;
            handle.stop().await;
        }
        Commands::List => {
            config.require_database_url("list")?;
            let pipeline = build_pipeline(&config).await?;
            for offering in pipeline.store().list_all().await? {
                println!(
                    "{}\t{} ({}, {})",
                    offering.observed_date, offering.name, offering.kind, offering.group
                );
            }
        }
        Commands::Clear => {
            config.require_database_url("clear")?;
            let pipeline = build_pipeline(&config).await?;
            let count = pipeline.store().clear().await?;
            println!("Successfully deleted {count} offerings.");
        }
        Commands::Migrate => {
            connect_database(config.require_database_url("migrate")?).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
