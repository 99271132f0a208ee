//! Background job scheduling
//!
//! Periodic maintenance around the task runner: a minutely queue-drain tick
//! (which also recovers after a missed post-completion drain), an hourly
//! event-log trim sweep, and a daily scratch-directory cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::Config;
use crate::db::Database;
use crate::services::TaskRunner;
use crate::services::task_runner::cleanup_scratch_dir;

/// Events kept per task by the trim sweep; matches the runner's own cadence
const EVENT_KEEP: i64 = 400;

/// Scratch files older than this are orphans from dead workers
const SCRATCH_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    runner: Arc<TaskRunner>,
    db: Database,
    config: Arc<Config>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Queue drain - every minute; idempotent, claims gate the actual work
    let drain_runner = runner.clone();
    let drain_job = Job::new_async("0 * * * * *", move |_uuid, _l| {
        let runner = drain_runner.clone();
        Box::pin(async move {
            if let Err(e) = runner.drain_queued().await {
                error!("Queue drain error: {}", e);
            }
        })
    })?;
    scheduler.add(drain_job).await?;

    // Event log trim sweep - hourly
    let trim_db = db.clone();
    let trim_job = Job::new_async("0 14 * * * *", move |_uuid, _l| {
        let db = trim_db.clone();
        Box::pin(async move {
            if let Err(e) = trim_event_logs(&db).await {
                error!("Event trim sweep error: {}", e);
            }
        })
    })?;
    scheduler.add(trim_job).await?;

    // Scratch cleanup - daily at 03:40
    let scratch_dir = config.downloads_path.clone();
    let cleanup_job = Job::new_async("0 40 3 * * *", move |_uuid, _l| {
        let dir = scratch_dir.clone();
        Box::pin(async move {
            cleanup_scratch_dir(&dir, SCRATCH_MAX_AGE).await;
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}

/// Trim every task whose event log outgrew the retention cap.
async fn trim_event_logs(db: &Database) -> anyhow::Result<()> {
    let over = db.task_events().task_ids_over_limit(EVENT_KEEP).await?;
    for task_id in over {
        let pruned = db.task_events().trim(task_id, EVENT_KEEP).await?;
        info!(task_id = %task_id, pruned = pruned, "Trimmed task event log");
    }
    Ok(())
}
