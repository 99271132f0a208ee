//! Cadenza acquisition worker
//!
//! Claims queued download tasks and turns each one into resolved, downloaded,
//! deduplicated, and filed audio assets. Runs either as a daemon (drain loop
//! plus maintenance jobs) or one-shot for a single task id.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadenza::cli::CliOptions;
use cadenza::config::Config;
use cadenza::db::Database;
use cadenza::jobs;
use cadenza::services::TaskRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadenza=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cadenza acquisition worker");

    tokio::fs::create_dir_all(&config.music_path).await?;
    tokio::fs::create_dir_all(&config.downloads_path).await?;

    let db = Database::connect(&config.database_url).await?;
    let runner = TaskRunner::new(db.clone(), config.clone());

    let options = CliOptions::from_args();

    if let Some(task_id) = options.task_id {
        tracing::info!(task_id = %task_id, "Running single task");
        runner.run_task(task_id).await?;
        return Ok(());
    }

    if options.drain_once {
        runner.drain_queued().await?;
        return Ok(());
    }

    // Daemon mode: pick up queued work now, then let the scheduler tick.
    runner.clone().drain_queued().await?;
    let _scheduler = jobs::start_scheduler(runner, db, config).await?;

    tracing::info!("Worker ready, waiting for tasks");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
