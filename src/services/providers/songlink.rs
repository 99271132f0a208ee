//! Cross-platform link resolution fallback
//!
//! When no catalog provider yields a stream, the song.link aggregation API
//! maps the submitted catalog URL to equivalent pages on other platforms the
//! extractor can download from directly. At most two alternates are returned;
//! this is the last line before recording a "no provider match" outcome.

use anyhow::{Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::services::rate_limiter::RateLimitedClient;

const API_URL: &str = "https://api.song.link/v1-alpha.1/links";

/// Platforms worth handing to the extractor, in preference order
const USABLE_PLATFORMS: [&str; 2] = ["youtube", "soundcloud"];

/// An equivalent page for the wanted track on another platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateLink {
    pub platform: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinksResponse {
    links_by_platform: HashMap<String, PlatformLink>,
}

#[derive(Debug, Deserialize)]
struct PlatformLink {
    url: String,
}

pub struct SonglinkResolver {
    client: RateLimitedClient,
}

impl SonglinkResolver {
    pub fn new() -> Self {
        Self {
            client: RateLimitedClient::for_link_resolution(),
        }
    }

    /// Map a catalog URL onto up to two alternate-platform links.
    pub async fn alternate_links(&self, source_url: &str) -> Result<Vec<AlternateLink>> {
        let response = self
            .client
            .get_with_query(API_URL, &[("url", source_url), ("userCountry", "US")])
            .await?;

        if !response.status().is_success() {
            bail!("song.link returned HTTP {}", response.status().as_u16());
        }

        let parsed: LinksResponse = response.json().await?;
        let links = pick_alternates(&parsed.links_by_platform);
        debug!(source = %source_url, alternates = links.len(), "Cross-platform link resolution complete");
        Ok(links)
    }
}

impl Default for SonglinkResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn pick_alternates(by_platform: &HashMap<String, PlatformLink>) -> Vec<AlternateLink> {
    USABLE_PLATFORMS
        .iter()
        .filter_map(|platform| {
            by_platform.get(*platform).map(|link| AlternateLink {
                platform: platform.to_string(),
                url: link.url.clone(),
            })
        })
        .collect()
}
