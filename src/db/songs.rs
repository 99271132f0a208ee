//! Library entry ("song") repository
//!
//! A song row is a resolved, filed asset. For a given (user, source kind,
//! canonical source URL) at most one live entry should exist; a UNIQUE index
//! backs that up, and insert races are surfaced as a distinct
//! [`SongInsertError::Duplicate`] so the pipeline can re-query for the row
//! the concurrent winner created instead of failing the item.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::sqlite_helpers::{
    is_unique_violation, now_str, str_to_datetime, str_to_uuid, uuid_to_str,
};
use super::tasks::SourceKind;

/// Library entry record
#[derive(Debug, Clone)]
pub struct SongRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_kind: SourceKind,
    /// Canonical source URL; the dedup key
    pub source_url: String,
    pub file_path: String,
    pub relative_path: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub track_number: Option<i64>,
    pub disc_number: Option<i64>,
    pub year: Option<i64>,
    pub duration_secs: Option<i64>,
    pub quality: Option<String>,
    pub task_id: Option<Uuid>,
    pub playlist_id: Option<Uuid>,
    pub artwork_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for SongRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;
        use std::str::FromStr;

        let decode = |e: anyhow::Error| sqlx::Error::Decode(e.into());

        let id_str: String = row.try_get("id")?;
        let user_id_str: String = row.try_get("user_id")?;
        let source_kind_str: String = row.try_get("source_kind")?;
        let task_id_str: Option<String> = row.try_get("task_id")?;
        let playlist_id_str: Option<String> = row.try_get("playlist_id")?;
        let created_at_str: String = row.try_get("created_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode)?,
            user_id: str_to_uuid(&user_id_str).map_err(decode)?,
            source_kind: SourceKind::from_str(&source_kind_str).map_err(decode)?,
            source_url: row.try_get("source_url")?,
            file_path: row.try_get("file_path")?,
            relative_path: row.try_get("relative_path")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            album: row.try_get("album")?,
            track_number: row.try_get("track_number")?,
            disc_number: row.try_get("disc_number")?,
            year: row.try_get("year")?,
            duration_secs: row.try_get("duration_secs")?,
            quality: row.try_get("quality")?,
            task_id: task_id_str.map(|s| str_to_uuid(&s)).transpose().map_err(decode)?,
            playlist_id: playlist_id_str.map(|s| str_to_uuid(&s)).transpose().map_err(decode)?,
            artwork_url: row.try_get("artwork_url")?,
            created_at: str_to_datetime(&created_at_str).map_err(decode)?,
            updated_at: str_to_datetime(&updated_at_str).map_err(decode)?,
        })
    }
}

/// Data for creating a new song
#[derive(Debug, Clone)]
pub struct CreateSong {
    pub user_id: Uuid,
    pub source_kind: SourceKind,
    pub source_url: String,
    pub file_path: String,
    pub relative_path: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub track_number: Option<i64>,
    pub disc_number: Option<i64>,
    pub year: Option<i64>,
    pub duration_secs: Option<i64>,
    pub quality: Option<String>,
    pub task_id: Option<Uuid>,
    pub playlist_id: Option<Uuid>,
}

/// Insert failure, with uniqueness conflicts kept distinct from other
/// write errors.
#[derive(Debug, thiserror::Error)]
pub enum SongInsertError {
    #[error("song already recorded for this source")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const SONG_COLUMNS: &str = r#"
    id, user_id, source_kind, source_url, file_path, relative_path,
    title, artist, album, track_number, disc_number, year, duration_secs,
    quality, task_id, playlist_id, artwork_url, created_at, updated_at
"#;

/// Songs database repository
pub struct SongRepository {
    pool: SqlitePool,
}

impl SongRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SongRecord>> {
        let sql = format!("SELECT {SONG_COLUMNS} FROM songs WHERE id = ?1");
        let record = sqlx::query_as::<_, SongRecord>(&sql)
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Create a song row. A uniqueness conflict on
    /// (user, source kind, canonical URL) is reported as
    /// [`SongInsertError::Duplicate`].
    pub async fn create(&self, data: CreateSong) -> Result<SongRecord, SongInsertError> {
        let id = Uuid::new_v4();
        let now = now_str();

        let result = sqlx::query(
            r#"
            INSERT INTO songs (
                id, user_id, source_kind, source_url, file_path, relative_path,
                title, artist, album, track_number, disc_number, year,
                duration_secs, quality, task_id, playlist_id, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(data.user_id))
        .bind(data.source_kind.to_string())
        .bind(&data.source_url)
        .bind(&data.file_path)
        .bind(&data.relative_path)
        .bind(&data.title)
        .bind(&data.artist)
        .bind(&data.album)
        .bind(data.track_number)
        .bind(data.disc_number)
        .bind(data.year)
        .bind(data.duration_secs)
        .bind(&data.quality)
        .bind(data.task_id.map(uuid_to_str))
        .bind(data.playlist_id.map(uuid_to_str))
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(SongInsertError::Duplicate),
            Err(e) => return Err(SongInsertError::Other(e.into())),
        }

        self.get(id)
            .await
            .map_err(SongInsertError::Other)?
            .ok_or_else(|| SongInsertError::Other(anyhow::anyhow!("song missing after insert")))
    }

    /// All entries recorded for a source, newest first. The dedup engine
    /// walks these through the path-safety check.
    pub async fn find_by_source(
        &self,
        user_id: Uuid,
        source_kind: SourceKind,
        canonical_url: &str,
    ) -> Result<Vec<SongRecord>> {
        let sql = format!(
            r#"
            SELECT {SONG_COLUMNS} FROM songs
            WHERE user_id = ?1 AND source_kind = ?2 AND source_url = ?3
            ORDER BY created_at DESC
            "#
        );
        let records = sqlx::query_as::<_, SongRecord>(&sql)
            .bind(uuid_to_str(user_id))
            .bind(source_kind.to_string())
            .bind(canonical_url)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Update stored paths after the path-healing check found the file at a
    /// different real location.
    pub async fn update_file_path(
        &self,
        id: Uuid,
        file_path: &str,
        relative_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE songs SET file_path = ?2, relative_path = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(uuid_to_str(id))
        .bind(file_path)
        .bind(relative_path)
        .bind(now_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record artwork resolved after the entry was created
    pub async fn update_artwork(&self, id: Uuid, artwork_url: &str) -> Result<()> {
        sqlx::query("UPDATE songs SET artwork_url = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(uuid_to_str(id))
            .bind(artwork_url)
            .bind(now_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete an entry whose file was confirmed missing under an allowed root
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM songs WHERE id = ?1")
            .bind(uuid_to_str(id))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
