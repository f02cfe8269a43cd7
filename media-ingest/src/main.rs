use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use media_ingest::config::AppConfig;
use media_ingest::database::repositories::{SqlxTaskRepository, TaskRepository};
use media_ingest::database::{self, DbPool};
use media_ingest::logging;
use media_ingest::panic_hook;
use media_ingest::pipeline::{FfprobeDurationProbe, ProcessorRegistry};
use media_ingest::watcher::WatchService;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the input tree and process new files until interrupted
    Run {
        /// Path to the JSON configuration file
        config: PathBuf,

        /// Enable debug logging for media-ingest
        #[arg(long)]
        debug: bool,
    },
    /// List recorded tasks, newest first
    Tasks {
        /// Path to the JSON configuration file
        config: PathBuf,

        /// Print the tasks as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, debug } => run(config, debug).await,
        Commands::Tasks { config, json } => list_tasks(config, json).await,
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<DbPool> {
    let pool = database::init_pool_with_size(
        &config.database_url(),
        database::pool_size_for_workers(config.worker_pool_size),
    )
    .await
    .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    database::run_migrations(&pool)
        .await
        .context("Failed to apply database migrations")?;
    Ok(pool)
}

async fn run(config_path: PathBuf, debug: bool) -> anyhow::Result<()> {
    let mut config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;

    let _log_guard = logging::init_logging(config.log_dir.as_deref(), debug)?;
    panic_hook::install(config.log_dir.clone());

    config
        .prepare_roots()
        .context("Failed to prepare input/output roots")?;
    let config = Arc::new(config);
    info!(
        input_root = %config.input_root.display(),
        output_root = %config.output_root.display(),
        rules = config.rules.len(),
        workers = config.worker_pool_size,
        "Starting media-ingest"
    );

    let registry = Arc::new(
        ProcessorRegistry::from_config(&config).context("Invalid rule configuration")?,
    );
    let pool = open_store(&config).await?;
    let repo: Arc<dyn TaskRepository> = Arc::new(SqlxTaskRepository::new(pool.clone()));
    let probe = Arc::new(FfprobeDurationProbe::new(config.ffprobe_path.clone()));

    let cancellation_token = CancellationToken::new();
    if let Some(log_dir) = &config.log_dir {
        logging::start_retention_cleanup(log_dir.clone(), cancellation_token.child_token());
    }

    let shutdown = cancellation_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
        shutdown.cancel();
    });

    let service = WatchService::new(config, repo, registry, probe, cancellation_token);
    service.run().await?;

    pool.close().await;
    Ok(())
}

async fn list_tasks(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    let pool = open_store(&config).await?;
    let repo = SqlxTaskRepository::new(pool.clone());
    let tasks = repo.list_all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        for task in &tasks {
            let detail = task
                .error
                .as_deref()
                .or(task.warning.as_deref())
                .unwrap_or("");
            println!(
                "{}  {:<9}  {:>3}%  {:<12}  {}  {}",
                task.created_at.format("%Y-%m-%d %H:%M:%S"),
                task.status.as_str(),
                task.progress,
                task.rule_name,
                task.source_path.display(),
                detail
            );
        }
        if tasks.is_empty() {
            println!("No tasks recorded");
        }
    }

    pool.close().await;
    Ok(())
}
