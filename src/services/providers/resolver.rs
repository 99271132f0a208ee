//! Multi-provider track resolution
//!
//! Fans out to every configured catalog provider in parallel, scores and
//! filters each provider's hits, attempts stream-URL resolution on the
//! survivors, then picks the best match across providers: highest quality
//! rank first, similarity score breaking ties. Providers fail independently;
//! a dead provider is logged as skipped and the others proceed. When nothing
//! matches, a cross-platform link-resolution fallback is tried before giving
//! up — a miss here is final and is never retried.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::services::similarity::{LIKELY_MATCH_THRESHOLD, score_track};

use super::songlink::{AlternateLink, SonglinkResolver};
use super::{ProviderAdapter, ProviderMatch, TrackCandidate, TrackTarget};
use crate::services::rate_limiter::retry_with_backoff;

/// Stream-URL resolution attempts per provider, counting only kept candidates
const MAX_URL_ATTEMPTS_PER_PROVIDER: usize = 5;

/// Where the bytes for a resolved track should come from
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    /// A provider granted a direct stream URL
    Provider(ProviderMatch),
    /// No provider matched; equivalent pages on alternate platforms for the
    /// extractor to try, in preference order
    Alternates(Vec<AlternateLink>),
}

pub struct TrackResolver {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    songlink: Option<SonglinkResolver>,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
}

impl TrackResolver {
    pub fn new(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        songlink: Option<SonglinkResolver>,
        retry_max_attempts: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            providers,
            songlink,
            retry_max_attempts,
            retry_base_delay,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Resolve the best downloadable source for a target track.
    ///
    /// `source_url` is the canonical catalog URL, used only by the
    /// cross-platform fallback. Returns `None` when neither the providers nor
    /// the fallback produced anything usable.
    pub async fn resolve(
        &self,
        target: &TrackTarget,
        source_url: Option<&str>,
    ) -> Option<ResolvedSource> {
        let matches = futures::future::join_all(
            self.providers
                .iter()
                .map(|provider| self.resolve_with_provider(provider.as_ref(), target)),
        )
        .await;

        let best = matches
            .into_iter()
            .flatten()
            .max_by(|a, b| {
                (a.quality.rank(), a.score)
                    .partial_cmp(&(b.quality.rank(), b.score))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        if let Some(chosen) = best {
            info!(
                provider = chosen.provider,
                quality = %chosen.quality,
                score = format!("{:.1}", chosen.score),
                title = %chosen.title,
                "Resolved provider match"
            );
            return Some(ResolvedSource::Provider(chosen));
        }

        // Secondary fallback: equivalent links on alternate platforms
        if let (Some(songlink), Some(url)) = (&self.songlink, source_url) {
            match songlink.alternate_links(url).await {
                Ok(links) if !links.is_empty() => {
                    info!(
                        alternates = links.len(),
                        title = %target.title,
                        "Falling back to alternate-platform links"
                    );
                    return Some(ResolvedSource::Alternates(links));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Cross-platform link resolution failed");
                }
            }
        }

        debug!(title = %target.title, "No provider match");
        None
    }

    /// Run one provider start to finish: search, score, filter, resolve.
    /// Every failure is contained here so other providers are unaffected.
    async fn resolve_with_provider(
        &self,
        provider: &dyn ProviderAdapter,
        target: &TrackTarget,
    ) -> Option<ProviderMatch> {
        let hits = match retry_with_backoff(
            || provider.search(target),
            self.retry_max_attempts,
            self.retry_base_delay,
            &format!("{} search", provider.name()),
        )
        .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Provider skipped");
                return None;
            }
        };

        let kept = rank_candidates(hits, target);
        if kept.is_empty() {
            debug!(provider = provider.name(), "No usable candidates");
            return None;
        }

        for candidate in kept {
            let resolved = retry_with_backoff(
                || provider.resolve_stream_url(&candidate),
                self.retry_max_attempts,
                self.retry_base_delay,
                &format!("{} stream resolution", provider.name()),
            )
            .await;

            match resolved {
                Ok(Some(stream)) => {
                    return Some(ProviderMatch {
                        provider: candidate.provider,
                        title: candidate.title,
                        artist: candidate.artist,
                        album: candidate.album,
                        duration_secs: candidate.duration_secs,
                        quality: stream.quality,
                        score: candidate.score,
                        stream_url: stream.url,
                        extension: stream.extension,
                    });
                }
                Ok(None) => {
                    debug!(
                        provider = provider.name(),
                        track_id = %candidate.provider_track_id,
                        "Provider declined to serve candidate"
                    );
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        track_id = %candidate.provider_track_id,
                        error = %e,
                        "Stream resolution failed, trying next candidate"
                    );
                }
            }
        }

        None
    }
}

/// Score candidates against the target, keep the likely ones (or the single
/// best as a last resort) sorted best-first, capped to bound resolution cost.
fn rank_candidates(hits: Vec<TrackCandidate>, target: &TrackTarget) -> Vec<TrackCandidate> {
    let mut scored: Vec<TrackCandidate> = hits
        .into_iter()
        .map(|mut candidate| {
            candidate.score = score_track(
                &target.title,
                &target.artists,
                target.album.as_deref(),
                target.duration_secs,
                &candidate.title,
                &candidate.artist,
                candidate.album.as_deref(),
                candidate.duration_secs,
            )
            .total;
            candidate
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let likely: Vec<TrackCandidate> = scored
        .iter()
        .filter(|c| c.score >= LIKELY_MATCH_THRESHOLD)
        .cloned()
        .collect();

    let mut kept = if likely.is_empty() {
        scored.into_iter().take(1).collect::<Vec<_>>()
    } else {
        likely
    };
    kept.truncate(MAX_URL_ATTEMPTS_PER_PROVIDER);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::ResolvedStream;
    use crate::services::quality::AudioQuality;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProvider {
        name: &'static str,
        hits: Vec<TrackCandidate>,
        stream: Option<ResolvedStream>,
        fail_search: bool,
        resolve_calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(name: &'static str, hits: Vec<TrackCandidate>, stream: Option<ResolvedStream>) -> Self {
            Self {
                name,
                hits,
                stream,
                fail_search: false,
                resolve_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, _target: &TrackTarget) -> Result<Vec<TrackCandidate>> {
            if self.fail_search {
                anyhow::bail!("missing credentials");
            }
            Ok(self.hits.clone())
        }

        async fn resolve_stream_url(
            &self,
            _candidate: &TrackCandidate,
        ) -> Result<Option<ResolvedStream>> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.stream.clone())
        }
    }

    fn target() -> TrackTarget {
        TrackTarget {
            title: "Time".into(),
            artists: vec!["Pink Floyd".into()],
            album: None,
            duration_secs: None,
        }
    }

    fn candidate(provider: &'static str, title: &str, quality: AudioQuality) -> TrackCandidate {
        TrackCandidate {
            provider,
            provider_track_id: "1".into(),
            title: title.into(),
            artist: "Pink Floyd".into(),
            album: None,
            duration_secs: None,
            quality,
            score: 0.0,
        }
    }

    fn stream(quality: AudioQuality) -> ResolvedStream {
        ResolvedStream {
            url: "https://cdn.example.com/stream".into(),
            quality,
            extension: "flac".into(),
        }
    }

    fn resolver(providers: Vec<Arc<dyn ProviderAdapter>>) -> TrackResolver {
        TrackResolver::new(providers, None, 1, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_failing_provider_does_not_abort_others() {
        let mut broken = MockProvider::new(
            "broken",
            vec![candidate("broken", "Time", AudioQuality::Lossless)],
            Some(stream(AudioQuality::Lossless)),
        );
        broken.fail_search = true;
        let working = MockProvider::new(
            "working",
            vec![candidate("working", "Time", AudioQuality::High)],
            Some(stream(AudioQuality::High)),
        );

        let resolved = resolver(vec![Arc::new(broken), Arc::new(working)])
            .resolve(&target(), None)
            .await;

        match resolved {
            Some(ResolvedSource::Provider(m)) => assert_eq!(m.provider, "working"),
            other => panic!("expected provider match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quality_rank_beats_similarity_score() {
        // Exact title on the lossless provider, fuzzier title on the hi-res
        // one; both are likely matches, so the higher rung must win.
        let lossless = MockProvider::new(
            "lossless",
            vec![candidate("lossless", "Time", AudioQuality::Lossless)],
            Some(stream(AudioQuality::Lossless)),
        );
        let hires = MockProvider::new(
            "hires",
            vec![candidate("hires", "Time Remastered", AudioQuality::HiRes96)],
            Some(stream(AudioQuality::HiRes96)),
        );

        let resolved = resolver(vec![Arc::new(lossless), Arc::new(hires)])
            .resolve(&target(), None)
            .await;

        match resolved {
            Some(ResolvedSource::Provider(m)) => {
                assert_eq!(m.provider, "hires");
                assert_eq!(m.quality, AudioQuality::HiRes96);
            }
            other => panic!("expected provider match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_url_attempts_are_capped() {
        let hits: Vec<TrackCandidate> = (0..10)
            .map(|_| candidate("many", "Time", AudioQuality::Lossless))
            .collect();
        let provider = Arc::new(MockProvider::new("many", hits, None));

        let resolved = resolver(vec![provider.clone()]).resolve(&target(), None).await;

        assert!(resolved.is_none());
        assert_eq!(
            provider.resolve_calls.load(Ordering::SeqCst),
            MAX_URL_ATTEMPTS_PER_PROVIDER
        );
    }

    #[tokio::test]
    async fn test_unlikely_best_candidate_is_still_attempted() {
        let mut unrelated_a = candidate("weak", "Completely Different Song", AudioQuality::High);
        unrelated_a.artist = "Someone Else".into();
        let mut unrelated_b = candidate("weak", "Also Unrelated", AudioQuality::High);
        unrelated_b.artist = "Another Band".into();
        let provider = Arc::new(MockProvider::new(
            "weak",
            vec![unrelated_a, unrelated_b],
            Some(stream(AudioQuality::High)),
        ));

        let resolved = resolver(vec![provider.clone()]).resolve(&target(), None).await;

        assert!(matches!(resolved, Some(ResolvedSource::Provider(_))));
        // Only the single best-scoring candidate was tried
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_match_and_no_fallback_returns_none() {
        let provider = MockProvider::new("empty", vec![], None);
        let resolved = resolver(vec![Arc::new(provider)]).resolve(&target(), None).await;
        assert!(resolved.is_none());
    }
}
