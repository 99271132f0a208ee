//! Tidal catalog adapter
//!
//! Search is a single request; stream resolution is not. Tidal serves
//! hi-res content through a server-side repackaging job: the first request
//! either returns a ready URL or a job id that must be polled until the
//! asset is prepared. The poll loop is bounded — a job that never completes
//! resolves to "no stream", it does not hang the item.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::services::quality::AudioQuality;
use crate::services::rate_limiter::{RateLimitedClient, poll_until};

use super::{ProviderAdapter, ResolvedStream, TrackCandidate, TrackTarget};

const API_BASE: &str = "https://api.tidal.com/v1";
const SEARCH_LIMIT: u32 = 10;
const COUNTRY: &str = "US";

/// Hard ceiling on repackaging-job polls per candidate
const MAX_JOB_POLLS: u32 = 6;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct TidalProvider {
    client: RateLimitedClient,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<TidalTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TidalTrack {
    id: u64,
    title: String,
    duration: Option<u32>,
    artist: Option<Named>,
    album: Option<Named>,
    audio_quality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named {
    title: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackResponse {
    status: Option<String>,
    job_id: Option<String>,
    url: Option<String>,
    audio_quality: Option<String>,
    codec: Option<String>,
}

impl TidalProvider {
    pub fn new(access_token: String) -> Self {
        Self {
            client: RateLimitedClient::for_provider("tidal"),
            access_token,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    fn stream_of(response: PlaybackResponse, fallback: AudioQuality) -> Option<ResolvedStream> {
        let url = response.url.filter(|u| !u.is_empty())?;
        let quality = response
            .audio_quality
            .as_deref()
            .map(AudioQuality::from_label)
            .unwrap_or(fallback);
        let extension = match response.codec.as_deref() {
            Some("AAC") | Some("MP4A") => "m4a",
            _ => "flac",
        };
        Some(ResolvedStream {
            url,
            quality,
            extension: extension.to_string(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for TidalProvider {
    fn name(&self) -> &'static str {
        "tidal"
    }

    async fn search(&self, target: &TrackTarget) -> Result<Vec<TrackCandidate>> {
        let query = match target.artists.first() {
            Some(artist) => format!("{} {}", artist, target.title),
            None => target.title.clone(),
        };
        let bearer = self.bearer();
        let limit = SEARCH_LIMIT.to_string();

        let response = self
            .client
            .get_with_headers_and_query(
                &format!("{API_BASE}/search/tracks"),
                &[("Authorization", bearer.as_str())],
                &[
                    ("query", query.as_str()),
                    ("limit", limit.as_str()),
                    ("countryCode", COUNTRY),
                ],
            )
            .await?;

        if !response.status().is_success() {
            bail!("tidal search returned HTTP {}", response.status().as_u16());
        }

        let parsed: SearchResponse = response.json().await?;
        debug!(hits = parsed.items.len(), "Tidal search complete");

        Ok(parsed
            .items
            .into_iter()
            .map(|track| TrackCandidate {
                provider: "tidal",
                provider_track_id: track.id.to_string(),
                quality: track
                    .audio_quality
                    .as_deref()
                    .map(AudioQuality::from_label)
                    .unwrap_or(AudioQuality::Lossless),
                artist: track
                    .artist
                    .as_ref()
                    .and_then(|a| a.name.clone())
                    .unwrap_or_default(),
                album: track.album.as_ref().and_then(|a| a.title.clone()),
                duration_secs: track.duration,
                title: track.title,
                score: 0.0,
            })
            .collect())
    }

    async fn resolve_stream_url(
        &self,
        candidate: &TrackCandidate,
    ) -> Result<Option<ResolvedStream>> {
        let bearer = self.bearer();
        let url = format!(
            "{API_BASE}/tracks/{}/playbackinfo",
            candidate.provider_track_id
        );

        let response = self
            .client
            .get_with_headers_and_query(
                &url,
                &[("Authorization", bearer.as_str())],
                &[
                    ("audioquality", "HI_RES_LOSSLESS"),
                    ("playbackmode", "STREAM"),
                    ("assetpresentation", "FULL"),
                    ("countryCode", COUNTRY),
                ],
            )
            .await?;

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 451 {
            // Unknown track or region-locked
            return Ok(None);
        }
        if !status.is_success() {
            bail!("tidal playbackinfo returned HTTP {}", status.as_u16());
        }

        let parsed: PlaybackResponse = response.json().await?;

        // Ready immediately
        if parsed.url.is_some() {
            return Ok(Self::stream_of(parsed, candidate.quality));
        }

        // The asset is being repackaged server-side; poll the job, bounded.
        let Some(job_id) = parsed.job_id else {
            return Ok(None);
        };
        debug!(job_id = %job_id, track_id = %candidate.provider_track_id, "Polling tidal repackaging job");

        let job_url = format!("{API_BASE}/playbackjobs/{job_id}");
        let quality = candidate.quality;
        let resolved = poll_until(
            || async {
                let response = self
                    .client
                    .get_with_headers_and_query(
                        &job_url,
                        &[("Authorization", bearer.as_str())],
                        &[("countryCode", COUNTRY)],
                    )
                    .await?;
                if !response.status().is_success() {
                    bail!("tidal playback job returned HTTP {}", response.status().as_u16());
                }
                let job: PlaybackResponse = response.json().await?;
                match job.status.as_deref() {
                    Some("FAILED") => bail!("tidal repackaging job failed"),
                    _ => Ok(Self::stream_of(job, quality)),
                }
            },
            MAX_JOB_POLLS,
            JOB_POLL_INTERVAL,
        )
        .await?;

        Ok(resolved)
    }
}
