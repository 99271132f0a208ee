//! Download task repository
//!
//! A `download_tasks` row is one user-submitted acquisition request. The
//! submission path creates it in `queued`; a worker claims it with an atomic
//! conditional update, mutates it exclusively until it reaches a terminal
//! state, and never re-opens it. Item counters are applied as SQL increments
//! so concurrent item completions within one task cannot lose updates.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::sqlite_helpers::{now_str, str_to_datetime, str_to_datetime_opt, str_to_uuid, uuid_to_str};

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::CompletedWithErrors | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "completed_with_errors" => Ok(TaskStatus::CompletedWithErrors),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown task status: {}", s)),
        }
    }
}

/// Where a submitted link points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Streaming-catalog link (track/album/playlist/artist page)
    Catalog,
    /// Direct video-site link
    Video,
    /// Direct audio-sharing-site link
    AudioShare,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Catalog => write!(f, "catalog"),
            SourceKind::Video => write!(f, "video"),
            SourceKind::AudioShare => write!(f, "audio_share"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "catalog" => Ok(SourceKind::Catalog),
            "video" => Ok(SourceKind::Video),
            "audio_share" => Ok(SourceKind::AudioShare),
            _ => Err(anyhow::anyhow!("Unknown source kind: {}", s)),
        }
    }
}

/// Download task record from the database
#[derive(Debug, Clone)]
pub struct DownloadTaskRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_kind: SourceKind,
    pub source_url: String,
    pub target_format: String,
    pub target_quality: String,
    pub prefer_source_codec: bool,
    pub playlist_id: Option<Uuid>,
    pub status: TaskStatus,
    pub is_playlist: bool,
    pub playlist_title: Option<String>,
    pub total_items: Option<i64>,
    pub processed_items: i64,
    pub successful_items: i64,
    pub failed_items: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub worker_handle: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DownloadTaskRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;
        use std::str::FromStr;

        let id_str: String = row.try_get("id")?;
        let user_id_str: String = row.try_get("user_id")?;
        let source_kind_str: String = row.try_get("source_kind")?;
        let status_str: String = row.try_get("status")?;
        let playlist_id_str: Option<String> = row.try_get("playlist_id")?;
        let started_at_str: Option<String> = row.try_get("started_at")?;
        let completed_at_str: Option<String> = row.try_get("completed_at")?;
        let heartbeat_str: Option<String> = row.try_get("last_heartbeat_at")?;
        let created_at_str: String = row.try_get("created_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;

        let decode = |e: anyhow::Error| sqlx::Error::Decode(e.into());

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode)?,
            user_id: str_to_uuid(&user_id_str).map_err(decode)?,
            source_kind: SourceKind::from_str(&source_kind_str).map_err(decode)?,
            source_url: row.try_get("source_url")?,
            target_format: row.try_get("target_format")?,
            target_quality: row.try_get("target_quality")?,
            prefer_source_codec: row.try_get("prefer_source_codec")?,
            playlist_id: playlist_id_str
                .map(|s| str_to_uuid(&s))
                .transpose()
                .map_err(decode)?,
            status: TaskStatus::from_str(&status_str).map_err(decode)?,
            is_playlist: row.try_get("is_playlist")?,
            playlist_title: row.try_get("playlist_title")?,
            total_items: row.try_get("total_items")?,
            processed_items: row.try_get("processed_items")?,
            successful_items: row.try_get("successful_items")?,
            failed_items: row.try_get("failed_items")?,
            started_at: str_to_datetime_opt(started_at_str.as_deref()).map_err(decode)?,
            completed_at: str_to_datetime_opt(completed_at_str.as_deref()).map_err(decode)?,
            error_message: row.try_get("error_message")?,
            worker_handle: row.try_get("worker_handle")?,
            last_heartbeat_at: str_to_datetime_opt(heartbeat_str.as_deref()).map_err(decode)?,
            created_at: str_to_datetime(&created_at_str).map_err(decode)?,
            updated_at: str_to_datetime(&updated_at_str).map_err(decode)?,
        })
    }
}

/// Data for creating a new download task (used by the submission path and tests)
#[derive(Debug, Clone)]
pub struct CreateDownloadTask {
    pub user_id: Uuid,
    pub source_kind: SourceKind,
    pub source_url: String,
    pub target_format: String,
    pub target_quality: String,
    pub prefer_source_codec: bool,
    pub playlist_id: Option<Uuid>,
}

/// Increments to apply to a task's item counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CountDelta {
    pub processed: i64,
    pub successful: i64,
    pub failed: i64,
}

impl CountDelta {
    pub fn success() -> Self {
        Self { processed: 1, successful: 1, failed: 0 }
    }

    pub fn failure() -> Self {
        Self { processed: 1, successful: 0, failed: 1 }
    }
}

const TASK_COLUMNS: &str = r#"
    id, user_id, source_kind, source_url, target_format, target_quality,
    prefer_source_codec, playlist_id, status, is_playlist, playlist_title,
    total_items, processed_items, successful_items, failed_items,
    started_at, completed_at, error_message, worker_handle, last_heartbeat_at,
    created_at, updated_at
"#;

/// Download tasks database repository
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a task by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<DownloadTaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM download_tasks WHERE id = ?1");
        let record = sqlx::query_as::<_, DownloadTaskRecord>(&sql)
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Create a new task in `queued` status
    pub async fn create(&self, data: CreateDownloadTask) -> Result<DownloadTaskRecord> {
        let id = Uuid::new_v4();
        let now = now_str();

        sqlx::query(
            r#"
            INSERT INTO download_tasks (
                id, user_id, source_kind, source_url, target_format, target_quality,
                prefer_source_codec, playlist_id, status, is_playlist,
                processed_items, successful_items, failed_items, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', 0, 0, 0, 0, ?9, ?9)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(data.user_id))
        .bind(data.source_kind.to_string())
        .bind(&data.source_url)
        .bind(&data.target_format)
        .bind(&data.target_quality)
        .bind(data.prefer_source_codec)
        .bind(data.playlist_id.map(uuid_to_str))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve task after insert"))
    }

    /// Atomically claim a queued task for this worker.
    ///
    /// Transitions queued → running only if the status is still `queued` at
    /// the time of the update. Returns `None` when another worker won the
    /// race (zero rows affected); the caller must then do nothing further
    /// with the task.
    pub async fn claim(&self, id: Uuid, worker_handle: &str) -> Result<Option<DownloadTaskRecord>> {
        let now = now_str();
        let result = sqlx::query(
            r#"
            UPDATE download_tasks
            SET status = 'running',
                worker_handle = ?2,
                started_at = ?3,
                last_heartbeat_at = ?3,
                updated_at = ?3
            WHERE id = ?1 AND status = 'queued'
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(worker_handle)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(id).await
    }

    /// Record worker liveness. Written on a fixed interval for the life of
    /// processing so an external reaper can detect dead workers.
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        let now = now_str();
        sqlx::query(
            "UPDATE download_tasks SET last_heartbeat_at = ?2, updated_at = ?2 WHERE id = ?1",
        )
        .bind(uuid_to_str(id))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set the definitive item count. Write-once: a task whose total is
    /// already known keeps its original value.
    pub async fn set_total_items(&self, id: Uuid, total: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_tasks
            SET total_items = ?2, updated_at = ?3
            WHERE id = ?1 AND total_items IS NULL
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(total)
        .bind(now_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the resolved playlist title
    pub async fn set_playlist_title(&self, id: Uuid, title: &str) -> Result<()> {
        sqlx::query(
            "UPDATE download_tasks SET playlist_title = ?2, is_playlist = 1, updated_at = ?3 WHERE id = ?1",
        )
        .bind(uuid_to_str(id))
        .bind(title)
        .bind(now_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Apply atomic increments to the item counters. Never read-modify-write:
    /// concurrent item completions within the same task must not lose updates.
    pub async fn increment_counts(&self, id: Uuid, delta: CountDelta) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_tasks
            SET processed_items = processed_items + ?2,
                successful_items = successful_items + ?3,
                failed_items = failed_items + ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(delta.processed)
        .bind(delta.successful)
        .bind(delta.failed)
        .bind(now_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a running task to its terminal success state: `completed` when no
    /// items failed, `completed_with_errors` otherwise. Clears the worker
    /// handle. A task that already reached a terminal state is untouched.
    pub async fn complete(&self, id: Uuid) -> Result<Option<TaskStatus>> {
        let now = now_str();
        let result = sqlx::query(
            r#"
            UPDATE download_tasks
            SET status = CASE WHEN failed_items = 0 THEN 'completed' ELSE 'completed_with_errors' END,
                completed_at = ?2,
                worker_handle = NULL,
                updated_at = ?2
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(self.get(id).await?.map(|t| t.status))
    }

    /// Move a running task to `failed` with a (pre-redacted) error message.
    pub async fn fail(&self, id: Uuid, message: &str) -> Result<()> {
        let now = now_str();
        sqlx::query(
            r#"
            UPDATE download_tasks
            SET status = 'failed',
                error_message = ?2,
                completed_at = ?3,
                worker_handle = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(message)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest queued tasks, up to `limit`
    pub async fn list_queued(&self, limit: i64) -> Result<Vec<DownloadTaskRecord>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM download_tasks WHERE status = 'queued' ORDER BY created_at ASC LIMIT ?1"
        );
        let records = sqlx::query_as::<_, DownloadTaskRecord>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Number of tasks currently claimed by some worker
    pub async fn count_running(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM download_tasks WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample_task(user_id: Uuid) -> CreateDownloadTask {
        CreateDownloadTask {
            user_id,
            source_kind: SourceKind::Catalog,
            source_url: "https://open.spotify.com/track/4u7EnebtmKWzUH433cf5Qv".to_string(),
            target_format: "flac".to_string(),
            target_quality: "lossless".to_string(),
            prefer_source_codec: false,
            playlist_id: None,
        }
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let db = Database::connect_in_memory().await.unwrap();
        let task = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();

        let claimed = db.tasks().claim(task.id, "worker-a").await.unwrap();
        assert!(claimed.is_some());
        let claimed = claimed.unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.worker_handle.as_deref(), Some("worker-a"));
        assert!(claimed.started_at.is_some());

        // Second claim observes zero affected rows
        let second = db.tasks().claim(task.id, "worker-b").await.unwrap();
        assert!(second.is_none());

        // The winner's handle is untouched
        let current = db.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(current.worker_handle.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_total_items_is_write_once() {
        let db = Database::connect_in_memory().await.unwrap();
        let task = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();

        db.tasks().set_total_items(task.id, 12).await.unwrap();
        db.tasks().set_total_items(task.id, 3).await.unwrap();

        let current = db.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(current.total_items, Some(12));
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let db = Database::connect_in_memory().await.unwrap();
        let task = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();
        db.tasks().claim(task.id, "w").await.unwrap();

        db.tasks().increment_counts(task.id, CountDelta::success()).await.unwrap();
        db.tasks().increment_counts(task.id, CountDelta::success()).await.unwrap();
        db.tasks().increment_counts(task.id, CountDelta::failure()).await.unwrap();

        let current = db.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(current.processed_items, 3);
        assert_eq!(current.successful_items, 2);
        assert_eq!(current.failed_items, 1);
        assert_eq!(
            current.processed_items,
            current.successful_items + current.failed_items
        );
    }

    #[tokio::test]
    async fn test_complete_picks_terminal_status() {
        let db = Database::connect_in_memory().await.unwrap();

        let clean = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();
        db.tasks().claim(clean.id, "w").await.unwrap();
        db.tasks().increment_counts(clean.id, CountDelta::success()).await.unwrap();
        let status = db.tasks().complete(clean.id).await.unwrap();
        assert_eq!(status, Some(TaskStatus::Completed));

        let lossy = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();
        db.tasks().claim(lossy.id, "w").await.unwrap();
        db.tasks().increment_counts(lossy.id, CountDelta::failure()).await.unwrap();
        let status = db.tasks().complete(lossy.id).await.unwrap();
        assert_eq!(status, Some(TaskStatus::CompletedWithErrors));

        // Terminal exactly once: a second complete is a no-op
        let again = db.tasks().complete(lossy.id).await.unwrap();
        assert_eq!(again, None);

        let current = db.tasks().get(lossy.id).await.unwrap().unwrap();
        assert!(current.worker_handle.is_none());
        assert!(current.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_records_message() {
        let db = Database::connect_in_memory().await.unwrap();
        let task = db.tasks().create(sample_task(Uuid::new_v4())).await.unwrap();
        db.tasks().claim(task.id, "w").await.unwrap();

        db.tasks().fail(task.id, "unsupported source URL").await.unwrap();

        let current = db.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Failed);
        assert_eq!(current.error_message.as_deref(), Some("unsupported source URL"));
        assert!(current.status.is_terminal());
    }
}
