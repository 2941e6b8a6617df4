//! `unica-wb` entry point: the HTTP front end (`serve`) and the queue
//! workers (`worker --queues builds,controls`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use uwb_axum::AppContext;
use uwb_broker::RedisBus;
use uwb_core::ServiceConfig;
use uwb_db::{SqliteJobStore, SqliteSettingsStore, setup_database};
use uwb_runtime::WorkerContext;
use uwb_runtime::cleanup::cleanup_stale_build_overrides;

#[derive(Parser)]
#[command(name = "unica-wb", about = "Build orchestration service for the UN1CA ROM pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP front end.
    Serve,
    /// Run queue workers.
    Worker {
        /// Comma-separated queue set to consume.
        #[arg(long, value_delimiter = ',', default_value = "builds,controls")]
        queues: Vec<String>,
    },
}

fn database_path(config: &ServiceConfig) -> PathBuf {
    let url = config
        .database_url
        .strip_prefix("sqlite://")
        .unwrap_or(&config.database_url);
    PathBuf::from(url)
}

async fn build_context(config: ServiceConfig) -> Result<Arc<WorkerContext>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    std::fs::create_dir_all(&config.logs_dir)
        .with_context(|| format!("creating {}", config.logs_dir.display()))?;

    let pool = setup_database(&database_path(&config)).await?;
    let bus = RedisBus::connect(&config.redis_url)
        .await
        .with_context(|| format!("connecting to redis at {}", config.redis_url))?;

    Ok(Arc::new(WorkerContext::new(
        config,
        Arc::new(SqliteJobStore::new(pool.clone())),
        Arc::new(SqliteSettingsStore::new(pool)),
        Arc::new(bus),
    )))
}

async fn run_serve(config: ServiceConfig) -> Result<()> {
    let worker = build_context(config).await?;

    // Startup hygiene: stale override leftovers and progress maps from a
    // previous run describe nothing that is still true.
    cleanup_stale_build_overrides(&worker.config);
    worker.firmware_progress.clear().await;
    worker.build_progress.clear().await;
    worker.repo_progress.clear().await;

    let state = Arc::new(AppContext::new(worker));
    uwb_axum::serve(state).await
}

async fn run_worker(config: ServiceConfig, queues: Vec<String>) -> Result<()> {
    let ctx = build_context(config).await?;

    let mut tasks = Vec::new();
    for queue in &queues {
        match queue.as_str() {
            "builds" => tasks.push(tokio::spawn(uwb_runtime::run_builds_worker(ctx.clone()))),
            "controls" => tasks.push(tokio::spawn(uwb_runtime::run_controls_worker(ctx.clone()))),
            other => bail!("unknown queue: {other}"),
        }
    }
    if tasks.is_empty() {
        bail!("no queues selected");
    }
    info!(queues = ?queues, "worker running");

    for task in tasks {
        task.await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command {
        Command::Serve => run_serve(config).await,
        Command::Worker { queues } => run_worker(config, queues).await,
    }
}
