//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (sqlite://... or a bare path)
    pub database_url: String,

    /// Managed music library root; all placed files live under here
    pub music_path: PathBuf,

    /// Scratch directory for in-flight downloads and transcodes
    pub downloads_path: PathBuf,

    /// Global ceiling on concurrently running tasks
    pub max_concurrent_tasks: usize,

    /// Concurrency ceiling for items within one playlist task
    pub playlist_concurrency: usize,

    /// Inter-download throttle window, milliseconds
    pub throttle_min_ms: u64,
    pub throttle_max_ms: u64,

    /// Retry ceiling and base delay for transient network failures
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,

    /// Hard ceiling on a single downloaded payload
    pub max_download_bytes: u64,

    /// Qobuz credentials (provider skipped when absent)
    pub qobuz_app_id: Option<String>,
    pub qobuz_user_token: Option<String>,

    /// Tidal credentials (provider skipped when absent)
    pub tidal_access_token: Option<String>,

    /// External tool paths
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cadenza");

        let database_url = env::var("CADENZA_DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}", data_dir.join("cadenza.db").display())
        });

        let music_path = env::var("CADENZA_MUSIC_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("music"));

        let downloads_path = env::var("CADENZA_DOWNLOADS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("downloads"));

        let max_concurrent_tasks = parse_var("CADENZA_MAX_CONCURRENT_TASKS", 2)?;
        let playlist_concurrency = parse_var("CADENZA_PLAYLIST_CONCURRENCY", 3)?;
        let throttle_min_ms = parse_var("CADENZA_THROTTLE_MIN_MS", 500)?;
        let throttle_max_ms = parse_var("CADENZA_THROTTLE_MAX_MS", 2500)?;
        let retry_max_attempts = parse_var("CADENZA_RETRY_MAX_ATTEMPTS", 3)?;
        let retry_base_delay_ms = parse_var("CADENZA_RETRY_BASE_DELAY_MS", 1000)?;
        let max_download_bytes = parse_var("CADENZA_MAX_DOWNLOAD_BYTES", 512 * 1024 * 1024)?;

        if throttle_max_ms < throttle_min_ms {
            anyhow::bail!(
                "CADENZA_THROTTLE_MAX_MS ({throttle_max_ms}) must be >= CADENZA_THROTTLE_MIN_MS ({throttle_min_ms})"
            );
        }

        Ok(Self {
            database_url,
            music_path,
            downloads_path,
            max_concurrent_tasks,
            playlist_concurrency,
            throttle_min_ms,
            throttle_max_ms,
            retry_max_attempts,
            retry_base_delay_ms,
            max_download_bytes,
            qobuz_app_id: env::var("QOBUZ_APP_ID").ok().filter(|s| !s.is_empty()),
            qobuz_user_token: env::var("QOBUZ_USER_TOKEN").ok().filter(|s| !s.is_empty()),
            tidal_access_token: env::var("TIDAL_ACCESS_TOKEN").ok().filter(|s| !s.is_empty()),
            ytdlp_path: env::var("CADENZA_YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_path: env::var("CADENZA_FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {value}")),
        Err(_) => Ok(default),
    }
}
