//! Qobuz catalog adapter
//!
//! Search plus direct stream-URL resolution. Qobuz reports per-track maximum
//! bit depth and sampling rate, which map cleanly onto the quality ladder;
//! stream resolution asks for the best format the account can serve and
//! reads the granted format back from the response.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::services::quality::AudioQuality;
use crate::services::rate_limiter::RateLimitedClient;

use super::{ProviderAdapter, ResolvedStream, TrackCandidate, TrackTarget};

const API_BASE: &str = "https://www.qobuz.com/api.json/0.2";
const SEARCH_LIMIT: u32 = 10;

pub struct QobuzProvider {
    client: RateLimitedClient,
    app_id: String,
    user_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Option<TrackPage>,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    items: Vec<QobuzTrack>,
}

#[derive(Debug, Deserialize)]
struct QobuzTrack {
    id: u64,
    title: String,
    duration: Option<u32>,
    performer: Option<Named>,
    album: Option<QobuzAlbum>,
    maximum_bit_depth: Option<u32>,
    maximum_sampling_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QobuzAlbum {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileUrlResponse {
    url: Option<String>,
    format_id: Option<u32>,
    mime_type: Option<String>,
}

impl QobuzProvider {
    pub fn new(app_id: String, user_token: String) -> Self {
        Self {
            client: RateLimitedClient::for_provider("qobuz"),
            app_id,
            user_token,
        }
    }

    fn auth_headers(&self) -> [(&str, &str); 2] {
        [
            ("X-App-Id", self.app_id.as_str()),
            ("X-User-Auth-Token", self.user_token.as_str()),
        ]
    }

    fn track_quality(track: &QobuzTrack) -> AudioQuality {
        match (track.maximum_bit_depth, track.maximum_sampling_rate) {
            (Some(depth), Some(rate)) if depth >= 24 && rate > 96.0 => AudioQuality::HiRes192,
            (Some(depth), _) if depth >= 24 => AudioQuality::HiRes96,
            (Some(depth), _) if depth >= 16 => AudioQuality::Lossless,
            _ => AudioQuality::High,
        }
    }

    /// Best Qobuz format id a track's quality can serve
    fn format_id(quality: AudioQuality) -> u32 {
        match quality {
            AudioQuality::HiRes192 => 27,
            AudioQuality::HiRes96 => 7,
            AudioQuality::Lossless => 6,
            _ => 5,
        }
    }
}

#[async_trait]
impl ProviderAdapter for QobuzProvider {
    fn name(&self) -> &'static str {
        "qobuz"
    }

    async fn search(&self, target: &TrackTarget) -> Result<Vec<TrackCandidate>> {
        let query = match target.artists.first() {
            Some(artist) => format!("{} {}", artist, target.title),
            None => target.title.clone(),
        };

        let limit = SEARCH_LIMIT.to_string();
        let response = self
            .client
            .get_with_headers_and_query(
                &format!("{API_BASE}/track/search"),
                &self.auth_headers(),
                &[("query", query.as_str()), ("limit", limit.as_str())],
            )
            .await?;

        if !response.status().is_success() {
            bail!("qobuz search returned HTTP {}", response.status().as_u16());
        }

        let parsed: SearchResponse = response.json().await?;
        let items = parsed.tracks.map(|t| t.items).unwrap_or_default();
        debug!(hits = items.len(), "Qobuz search complete");

        Ok(items
            .into_iter()
            .map(|track| TrackCandidate {
                provider: "qobuz",
                provider_track_id: track.id.to_string(),
                quality: Self::track_quality(&track),
                title: track.title.clone(),
                artist: track.performer.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
                album: track.album.as_ref().and_then(|a| a.title.clone()),
                duration_secs: track.duration,
                score: 0.0,
            })
            .collect())
    }

    async fn resolve_stream_url(
        &self,
        candidate: &TrackCandidate,
    ) -> Result<Option<ResolvedStream>> {
        let format_id = Self::format_id(candidate.quality).to_string();
        let response = self
            .client
            .get_with_headers_and_query(
                &format!("{API_BASE}/track/getFileUrl"),
                &self.auth_headers(),
                &[
                    ("track_id", candidate.provider_track_id.as_str()),
                    ("format_id", format_id.as_str()),
                    ("intent", "download"),
                ],
            )
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("qobuz getFileUrl returned HTTP {}", status.as_u16());
        }

        let parsed: FileUrlResponse = response.json().await?;
        let Some(url) = parsed.url.filter(|u| !u.is_empty()) else {
            // Track exists but the account tier cannot stream it
            return Ok(None);
        };

        let quality = match parsed.format_id {
            Some(27) => AudioQuality::HiRes192,
            Some(7) => AudioQuality::HiRes96,
            Some(6) => AudioQuality::Lossless,
            Some(_) => AudioQuality::High,
            None => candidate.quality,
        };

        let extension = match parsed.mime_type.as_deref() {
            Some("audio/mpeg") => "mp3",
            _ => "flac",
        };

        Ok(Some(ResolvedStream {
            url,
            quality,
            extension: extension.to_string(),
        }))
    }
}
