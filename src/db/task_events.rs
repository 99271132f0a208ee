//! Task event log repository
//!
//! Append-only progress log tied to a task. Entries are never mutated; old
//! entries are pruned periodically so the table stays bounded regardless of
//! how chatty a long playlist run gets.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::sqlite_helpers::{now_str, str_to_datetime, str_to_uuid, uuid_to_str};

/// Event severity/kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    /// Task status transitions
    Status,
    /// Batch progress milestones
    Progress,
    /// Per-track outcomes
    Track,
    Error,
    Info,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLevel::Status => write!(f, "status"),
            EventLevel::Progress => write!(f, "progress"),
            EventLevel::Track => write!(f, "track"),
            EventLevel::Error => write!(f, "error"),
            EventLevel::Info => write!(f, "info"),
        }
    }
}

/// Task event record
#[derive(Debug, Clone)]
pub struct TaskEventRecord {
    pub seq: i64,
    pub task_id: Uuid,
    pub level: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for TaskEventRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let task_id_str: String = row.try_get("task_id")?;
        let payload_str: Option<String> = row.try_get("payload")?;
        let created_at_str: String = row.try_get("created_at")?;

        Ok(Self {
            seq: row.try_get("seq")?,
            task_id: str_to_uuid(&task_id_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            payload: payload_str.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: str_to_datetime(&created_at_str)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
        })
    }
}

/// Task events database repository
pub struct TaskEventRepository {
    pool: SqlitePool,
}

impl TaskEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event. Returns the total number of events recorded for the
    /// task so the caller can trigger trimming every Nth append.
    pub async fn append(
        &self,
        task_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, level, message, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(uuid_to_str(task_id))
        .bind(level.to_string())
        .bind(message)
        .bind(payload.map(|p| p.to_string()))
        .bind(now_str())
        .execute(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_events WHERE task_id = ?1")
            .bind(uuid_to_str(task_id))
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Delete everything but the newest `keep` events of a task. Returns the
    /// number of rows pruned.
    pub async fn trim(&self, task_id: Uuid, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM task_events
            WHERE task_id = ?1
              AND seq NOT IN (
                  SELECT seq FROM task_events
                  WHERE task_id = ?1
                  ORDER BY seq DESC
                  LIMIT ?2
              )
            "#,
        )
        .bind(uuid_to_str(task_id))
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Newest events for a task, up to `limit`
    pub async fn list(&self, task_id: Uuid, limit: i64) -> Result<Vec<TaskEventRecord>> {
        let records = sqlx::query_as::<_, TaskEventRecord>(
            r#"
            SELECT seq, task_id, level, message, payload, created_at
            FROM task_events
            WHERE task_id = ?1
            ORDER BY seq DESC
            LIMIT ?2
            "#,
        )
        .bind(uuid_to_str(task_id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Task ids that currently have more than `keep` events recorded.
    /// Used by the periodic trim sweep.
    pub async fn task_ids_over_limit(&self, keep: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT task_id FROM task_events GROUP BY task_id HAVING COUNT(*) > ?1",
        )
        .bind(keep)
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|s| str_to_uuid(s)).collect()
    }
}
