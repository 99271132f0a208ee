//! Catalog provider adapters
//!
//! Every configured provider exposes the same two capabilities: search for a
//! wanted track, and turn a chosen hit into an actually downloadable stream
//! URL. Providers are built from config into a polymorphic list; one being
//! absent or misconfigured never affects the others.

pub mod qobuz;
pub mod resolver;
pub mod songlink;
pub mod tidal;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::services::quality::AudioQuality;

pub use resolver::{ResolvedSource, TrackResolver};

/// The track we are trying to acquire
#[derive(Debug, Clone)]
pub struct TrackTarget {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
}

/// A search hit from one provider, scored against the target by the resolver
#[derive(Debug, Clone)]
pub struct TrackCandidate {
    pub provider: &'static str,
    /// Provider-internal track id used for stream resolution
    pub provider_track_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub quality: AudioQuality,
    /// Similarity score against the target; filled in by the resolver
    pub score: f64,
}

/// A resolved, downloadable stream for a candidate
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub url: String,
    pub quality: AudioQuality,
    /// File extension the stream payload should be stored under
    pub extension: String,
}

/// A candidate confirmed to have a resolvable download URL
#[derive(Debug, Clone)]
pub struct ProviderMatch {
    pub provider: &'static str,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub quality: AudioQuality,
    pub score: f64,
    pub stream_url: String,
    pub extension: String,
}

/// One catalog provider's capability surface
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Search the provider's catalog for the target track.
    async fn search(&self, target: &TrackTarget) -> Result<Vec<TrackCandidate>>;

    /// Obtain an actual download URL for a candidate. `Ok(None)` means the
    /// provider declined (region lock, subscription tier) — not an error.
    async fn resolve_stream_url(&self, candidate: &TrackCandidate) -> Result<Option<ResolvedStream>>;
}

/// Build the adapter list from configured credentials. Providers with missing
/// credentials are simply not constructed.
pub fn build_providers(config: &Config) -> Vec<Arc<dyn ProviderAdapter>> {
    let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    if let (Some(app_id), Some(token)) = (&config.qobuz_app_id, &config.qobuz_user_token) {
        providers.push(Arc::new(qobuz::QobuzProvider::new(
            app_id.clone(),
            token.clone(),
        )));
    }

    if let Some(token) = &config.tidal_access_token {
        providers.push(Arc::new(tidal::TidalProvider::new(token.clone())));
    }

    providers
}
