//! Database connection and repositories

pub mod songs;
pub mod sqlite_helpers;
pub mod task_events;
pub mod tasks;

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub use songs::{CreateSong, SongInsertError, SongRecord, SongRepository};
pub use task_events::{EventLevel, TaskEventRecord, TaskEventRepository};
pub use tasks::{
    CountDelta, CreateDownloadTask, DownloadTaskRecord, SourceKind, TaskRepository, TaskStatus,
};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the SQLite database at `url` and ensure the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database URL: {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open database")?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for unit tests. A single connection keeps every
    /// query on the same memory store.
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    pub fn task_events(&self) -> TaskEventRepository {
        TaskEventRepository::new(self.pool.clone())
    }

    pub fn songs(&self) -> SongRepository {
        SongRepository::new(self.pool.clone())
    }

    /// Create the tables and indexes this worker owns. Idempotent.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                source_url TEXT NOT NULL,
                target_format TEXT NOT NULL,
                target_quality TEXT NOT NULL,
                prefer_source_codec INTEGER NOT NULL DEFAULT 0,
                playlist_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                is_playlist INTEGER NOT NULL DEFAULT 0,
                playlist_title TEXT,
                total_items INTEGER,
                processed_items INTEGER NOT NULL DEFAULT 0,
                successful_items INTEGER NOT NULL DEFAULT 0,
                failed_items INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                worker_handle TEXT,
                last_heartbeat_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_download_tasks_status ON download_tasks (status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events (task_id, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                source_url TEXT NOT NULL,
                file_path TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                album TEXT,
                track_number INTEGER,
                disc_number INTEGER,
                year INTEGER,
                duration_secs INTEGER,
                quality TEXT,
                task_id TEXT,
                playlist_id TEXT,
                artwork_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_songs_source ON songs (user_id, source_kind, source_url)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
