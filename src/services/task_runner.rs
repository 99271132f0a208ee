//! Task lifecycle manager
//!
//! Owns the DownloadTask state machine: claiming, heartbeats, event logging,
//! per-item processing, completion accounting, and draining of queued work up
//! to the worker cap. `run_task` is the entry point invoked by the submission
//! mechanism and by the drain hook.
//!
//! Failure semantics: one catch at the top level converts any error escaping
//! the per-source pipeline into `fail()`. Per-item errors never reach that
//! level — each item's worker converts them into a recorded failed-item
//! outcome and the batch continues.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    CountDelta, CreateSong, Database, DownloadTaskRecord, EventLevel, SongInsertError, SourceKind,
};

use super::dedup::{DedupEngine, canonical_source_url};
use super::extractor::{ExtractedTrack, ExtractorService, SourceMetadata};
use super::fetch::{FetchClient, remove_quietly};
use super::placement::{PlacementEngine, PlacementMetadata};
use super::providers::{ResolvedSource, TrackResolver, TrackTarget, build_providers};
use super::providers::songlink::SonglinkResolver;
use super::rate_limiter::{Throttle, retry_with_backoff};
use super::redact::redact_secrets;
use super::runner::run_bounded;
use super::transcoder::{TranscoderService, can_skip_transcode};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Every Nth event append triggers a trim of that task's log
const EVENT_TRIM_EVERY: i64 = 25;
/// Events kept per task after a trim
const EVENT_KEEP: i64 = 400;

/// How one item ended up
#[derive(Debug)]
enum ItemOutcome {
    /// Bytes were fetched, transcoded, placed, and recorded
    Downloaded { title: String },
    /// An existing library entry was reused; no network activity
    Reused { title: String },
    Failed { title: String, reason: String },
}

impl ItemOutcome {
    fn delta(&self) -> CountDelta {
        match self {
            ItemOutcome::Downloaded { .. } | ItemOutcome::Reused { .. } => CountDelta::success(),
            ItemOutcome::Failed { .. } => CountDelta::failure(),
        }
    }

    fn performed_download(&self) -> bool {
        matches!(self, ItemOutcome::Downloaded { .. })
    }
}

/// What a successful acquisition produced, before recording
struct AcquiredAsset {
    temp_path: std::path::PathBuf,
    extension: String,
    quality: Option<String>,
}

/// Orchestrates complete download tasks against the shared services.
pub struct TaskRunner {
    db: Database,
    config: Arc<Config>,
    resolver: TrackResolver,
    extractor: ExtractorService,
    transcoder: TranscoderService,
    fetch: FetchClient,
    dedup: DedupEngine,
    placement: PlacementEngine,
    throttle: Throttle,
    /// Tasks being processed by this process; the DB claim remains the
    /// authoritative cross-process gate
    in_flight: Mutex<HashSet<Uuid>>,
}

impl TaskRunner {
    pub fn new(db: Database, config: Arc<Config>) -> Arc<Self> {
        let providers = build_providers(&config);
        info!(providers = providers.len(), "Configured catalog providers");

        let resolver = TrackResolver::new(
            providers,
            Some(SonglinkResolver::new()),
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
        );

        Arc::new(Self {
            resolver,
            extractor: ExtractorService::new(config.ytdlp_path.clone()),
            transcoder: TranscoderService::new(config.ffmpeg_path.clone()),
            fetch: FetchClient::new(config.downloads_path.clone(), config.max_download_bytes),
            dedup: DedupEngine::new(db.clone(), vec![config.music_path.clone()]),
            placement: PlacementEngine::new(config.music_path.clone()),
            throttle: Throttle::new(config.throttle_min_ms, config.throttle_max_ms),
            db,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Process one task end to end. Invoked by the submission mechanism and
    /// by the queue drain; safe to call for a task someone else already owns.
    pub async fn run_task(self: Arc<Self>, task_id: Uuid) -> Result<()> {
        if !self.in_flight.lock().insert(task_id) {
            debug!(task_id = %task_id, "Task already in flight in this process");
            return Ok(());
        }
        let result = self.clone().run_claimed(task_id).await;
        self.in_flight.lock().remove(&task_id);

        // A terminal task frees a worker slot; pull in queued work.
        if let Err(e) = self.clone().drain_queued().await {
            warn!(error = %e, "Queue drain after task completion failed");
        }

        result
    }

    async fn run_claimed(self: Arc<Self>, task_id: Uuid) -> Result<()> {
        let worker_handle = worker_handle();
        let Some(task) = self.db.tasks().claim(task_id, &worker_handle).await? else {
            debug!(task_id = %task_id, "Task not claimable (already taken or terminal)");
            return Ok(());
        };

        info!(
            task_id = %task.id,
            source_kind = %task.source_kind,
            url = %task.source_url,
            worker = %worker_handle,
            "Claimed download task"
        );
        self.log_event(
            task.id,
            EventLevel::Status,
            "processing started",
            Some(json!({ "worker": worker_handle })),
        )
        .await;

        // Liveness beacon, independent of item progress, until processing ends.
        let heartbeat = {
            let db = self.db.clone();
            let id = task.id;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    if let Err(e) = db.tasks().heartbeat(id).await {
                        warn!(task_id = %id, error = %e, "Heartbeat write failed");
                    }
                }
            })
        };

        // The single catch: anything escaping the pipeline fails the task.
        let outcome = self.clone().process_task(&task).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                let status = self.db.tasks().complete(task.id).await?;
                info!(task_id = %task.id, status = ?status, "Task finished");
                self.log_event(task.id, EventLevel::Status, "processing finished", None)
                    .await;
            }
            Err(e) => {
                let message = redact_secrets(&format!("{e:#}"));
                error!(task_id = %task.id, error = %message, "Task failed");
                self.db.tasks().fail(task.id, &message).await?;
                self.log_event(task.id, EventLevel::Error, &message, None).await;
            }
        }

        Ok(())
    }

    /// Dispatch to the source-specific pipeline.
    async fn process_task(self: Arc<Self>, task: &DownloadTaskRecord) -> Result<()> {
        let canonical_url = canonical_source_url(task.source_kind, &task.source_url)
            .context("unsupported source URL")?;

        let metadata = retry_with_backoff(
            || self.extractor.probe(&canonical_url),
            self.config.retry_max_attempts,
            Duration::from_millis(self.config.retry_base_delay_ms),
            "metadata probe",
        )
        .await
        .context("source metadata extraction failed")?;

        match metadata {
            SourceMetadata::Single(track) => {
                self.db.tasks().set_total_items(task.id, 1).await?;
                let outcome = self.process_item(task, track, 0).await;
                self.record_outcome(task, &outcome, 0).await;
                Ok(())
            }
            SourceMetadata::Playlist { title, entries } => {
                if let Some(title) = &title {
                    self.db.tasks().set_playlist_title(task.id, title).await?;
                }
                self.db
                    .tasks()
                    .set_total_items(task.id, entries.len() as i64)
                    .await?;
                self.log_event(
                    task.id,
                    EventLevel::Progress,
                    "playlist resolved",
                    Some(json!({ "title": title, "items": entries.len() })),
                )
                .await;

                let runner = self.clone();
                run_bounded(entries, self.config.playlist_concurrency, |track, index| {
                    let runner = runner.clone();
                    let task = task.clone();
                    async move {
                        let outcome = runner.process_item(&task, track, index).await;
                        runner.record_outcome(&task, &outcome, index).await;
                        // Hold the concurrency slot through the throttle window
                        if outcome.performed_download() {
                            runner.throttle.pause().await;
                        }
                    }
                })
                .await;

                Ok(())
            }
        }
    }

    /// Process one item. Never returns an error: every failure becomes a
    /// recorded failed-item outcome so the batch continues.
    async fn process_item(
        &self,
        task: &DownloadTaskRecord,
        item: ExtractedTrack,
        index: usize,
    ) -> ItemOutcome {
        let title = item.title.clone();
        match self.acquire_item(task, &item, index).await {
            Ok(reused) => {
                if reused {
                    ItemOutcome::Reused { title }
                } else {
                    ItemOutcome::Downloaded { title }
                }
            }
            Err(e) => ItemOutcome::Failed {
                title,
                reason: redact_secrets(&format!("{e:#}")),
            },
        }
    }

    /// The per-item stage sequence: dedup → resolve → fetch → transcode →
    /// place → record. Returns whether an existing entry was reused.
    async fn acquire_item(
        &self,
        task: &DownloadTaskRecord,
        item: &ExtractedTrack,
        index: usize,
    ) -> Result<bool> {
        let item_url = canonical_source_url(task.source_kind, &item.url)
            .unwrap_or_else(|_| item.url.clone());

        // Stage: dedup
        if let Some(existing) = self
            .dedup
            .find_reusable(task.user_id, task.source_kind, &item_url)
            .await
            .context("dedup lookup failed")?
        {
            debug!(
                task_id = %task.id,
                index = index,
                path = %existing.file_path,
                "Reusing existing library entry"
            );
            return Ok(true);
        }

        // Stage: resolve + fetch
        let asset = self.fetch_item_bytes(task, item, &item_url).await?;

        // Stage: transcode
        let final_file = if can_skip_transcode(
            &asset.temp_path,
            &task.target_format,
            task.prefer_source_codec,
        ) {
            asset.temp_path.clone()
        } else {
            let output = self
                .transcoder
                .transcode(
                    &asset.temp_path,
                    &self.config.downloads_path,
                    &task.target_format,
                    &task.target_quality,
                )
                .await
                .context("transcode failed")?;
            remove_quietly(&asset.temp_path).await;
            output
        };

        // Stage: place
        let extension = final_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(&asset.extension)
            .to_string();
        let placement_meta = placement_metadata(item);
        let placed = self
            .placement
            .place(&final_file, &placement_meta, &extension)
            .await
            .context("file placement failed")?;

        // Stage: record. Read the real asset back so the entry reflects it.
        let probed = self.transcoder.probe_file(&placed.absolute_path).await.ok();
        let duration = probed
            .and_then(|p| p.duration_secs)
            .map(|d| d as i64)
            .or(item.duration_secs.map(|d| d as i64));

        let create = CreateSong {
            user_id: task.user_id,
            source_kind: task.source_kind,
            source_url: item_url.clone(),
            file_path: placed.absolute_path.to_string_lossy().to_string(),
            relative_path: placed.relative_path.to_string_lossy().to_string(),
            title: item.title.clone(),
            artist: item.artists.join(", "),
            album: item.album.clone(),
            track_number: item.track_number.map(|n| n as i64),
            disc_number: item.disc_number.map(|n| n as i64),
            year: item.year.map(|y| y as i64),
            duration_secs: duration,
            quality: asset.quality.clone(),
            task_id: Some(task.id),
            playlist_id: task.playlist_id,
        };

        match self.db.songs().create(create).await {
            Ok(song) => {
                if let Some(thumbnail) = &item.thumbnail_url {
                    if let Err(e) = self.db.songs().update_artwork(song.id, thumbnail).await {
                        debug!(song_id = %song.id, error = %e, "Artwork update failed");
                    }
                }
                Ok(false)
            }
            Err(SongInsertError::Duplicate) => {
                // A concurrent worker recorded this source first. Their entry
                // wins; our freshly placed file is superseded.
                info!(
                    task_id = %task.id,
                    url = %item_url,
                    "Lost entry-creation race, reusing the winner's entry"
                );
                remove_quietly(&placed.absolute_path).await;
                let existing = self
                    .dedup
                    .find_reusable(task.user_id, task.source_kind, &item_url)
                    .await?;
                match existing {
                    Some(_) => Ok(true),
                    None => Err(anyhow!("concurrent entry vanished before reuse")),
                }
            }
            Err(SongInsertError::Other(e)) => Err(e.context("recording library entry failed")),
        }
    }

    /// Obtain the audio bytes for an item, routed by source kind.
    async fn fetch_item_bytes(
        &self,
        task: &DownloadTaskRecord,
        item: &ExtractedTrack,
        item_url: &str,
    ) -> Result<AcquiredAsset> {
        match task.source_kind {
            SourceKind::Catalog => {
                let target = track_target(item);
                let resolved = self
                    .resolver
                    .resolve(&target, Some(item_url))
                    .await
                    .ok_or_else(|| anyhow!("no provider match for \"{}\"", item.title))?;

                match resolved {
                    ResolvedSource::Provider(matched) => {
                        let (temp_path, bytes) = retry_with_backoff(
                            || self.fetch.download_to_temp(&matched.stream_url, &matched.extension),
                            self.config.retry_max_attempts,
                            Duration::from_millis(self.config.retry_base_delay_ms),
                            "stream download",
                        )
                        .await?;
                        debug!(
                            provider = matched.provider,
                            bytes = bytes,
                            quality = %matched.quality,
                            "Provider stream downloaded"
                        );
                        Ok(AcquiredAsset {
                            temp_path,
                            extension: matched.extension,
                            quality: Some(matched.quality.to_string()),
                        })
                    }
                    ResolvedSource::Alternates(links) => {
                        let mut last_err = anyhow!("no alternate links to try");
                        for link in links {
                            match self
                                .extractor
                                .download_audio(&link.url, &self.config.downloads_path)
                                .await
                            {
                                Ok(path) => {
                                    let extension = path
                                        .extension()
                                        .and_then(|e| e.to_str())
                                        .unwrap_or("m4a")
                                        .to_string();
                                    return Ok(AcquiredAsset {
                                        temp_path: path,
                                        extension,
                                        quality: None,
                                    });
                                }
                                Err(e) => {
                                    warn!(
                                        platform = %link.platform,
                                        error = %e,
                                        "Alternate-platform download failed"
                                    );
                                    last_err = e;
                                }
                            }
                        }
                        Err(last_err.context("all alternate platforms failed"))
                    }
                }
            }
            SourceKind::Video | SourceKind::AudioShare => {
                let path = retry_with_backoff(
                    || self.extractor.download_audio(item_url, &self.config.downloads_path),
                    self.config.retry_max_attempts,
                    Duration::from_millis(self.config.retry_base_delay_ms),
                    "direct audio extraction",
                )
                .await?;
                let extension = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("m4a")
                    .to_string();
                Ok(AcquiredAsset {
                    temp_path: path,
                    extension,
                    quality: None,
                })
            }
        }
    }

    /// Count and log one settled item.
    async fn record_outcome(&self, task: &DownloadTaskRecord, outcome: &ItemOutcome, index: usize) {
        if let Err(e) = self.db.tasks().increment_counts(task.id, outcome.delta()).await {
            error!(task_id = %task.id, error = %e, "Failed to update item counters");
        }

        match outcome {
            ItemOutcome::Downloaded { title } => {
                self.log_event(
                    task.id,
                    EventLevel::Track,
                    &format!("downloaded \"{title}\""),
                    Some(json!({ "index": index, "status": "downloaded" })),
                )
                .await;
            }
            ItemOutcome::Reused { title } => {
                self.log_event(
                    task.id,
                    EventLevel::Track,
                    &format!("reused existing file for \"{title}\""),
                    Some(json!({ "index": index, "status": "reused" })),
                )
                .await;
            }
            ItemOutcome::Failed { title, reason } => {
                warn!(task_id = %task.id, index = index, title = %title, reason = %reason, "Item failed");
                self.log_event(
                    task.id,
                    EventLevel::Track,
                    &format!("failed \"{title}\": {reason}"),
                    Some(json!({ "index": index, "status": "failed" })),
                )
                .await;
            }
        }
    }

    /// Append a task event; every Nth append trims the task's log.
    async fn log_event(
        &self,
        task_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) {
        match self.db.task_events().append(task_id, level, message, payload).await {
            Ok(count) if count % EVENT_TRIM_EVERY == 0 => {
                if let Err(e) = self.db.task_events().trim(task_id, EVENT_KEEP).await {
                    debug!(task_id = %task_id, error = %e, "Event trim failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Event append failed");
            }
        }
    }

    /// Spawn workers for queued tasks up to the configured ceiling.
    /// Idempotent and safe to call redundantly: claims gate actual work.
    pub fn drain_queued(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
        // Return an explicitly-boxed `Send` future to break the auto-trait
        // inference cycle between `run_task` and `drain_queued` (mutual async
        // recursion via the spawn below).
        Box::pin(async move {
            let running = self.db.tasks().count_running().await?;
            let capacity = self
                .config
                .max_concurrent_tasks
                .saturating_sub(running as usize);
            if capacity == 0 {
                return Ok(());
            }

            let queued = self.db.tasks().list_queued(capacity as i64).await?;
            for task in queued {
                let runner = self.clone();
                info!(task_id = %task.id, "Draining queued task");
                tokio::spawn(async move {
                    if let Err(e) = runner.run_task(task.id).await {
                        error!(task_id = %task.id, error = %e, "Drained task errored");
                    }
                });
            }

            Ok(())
        })
    }
}

fn worker_handle() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}:{}:{}", std::process::id(), &Uuid::new_v4().to_string()[..8])
}

fn track_target(item: &ExtractedTrack) -> TrackTarget {
    TrackTarget {
        title: item.title.clone(),
        artists: item.artists.clone(),
        album: item.album.clone(),
        duration_secs: item.duration_secs,
    }
}

fn placement_metadata(item: &ExtractedTrack) -> PlacementMetadata {
    PlacementMetadata {
        artist: item.artists.first().cloned().unwrap_or_default(),
        album: item.album.clone().unwrap_or_default(),
        title: item.title.clone(),
        track_number: item.track_number,
        disc_number: item.disc_number,
        year: item.year,
    }
}

/// Strip a temp directory of scratch files older than `max_age`. Best-effort;
/// failures are logged and swallowed.
pub async fn cleanup_scratch_dir(dir: &Path, max_age: Duration) -> usize {
    let mut removed = 0;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let stale = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed = removed, "Cleaned up stale scratch files");
    }
    removed
}
