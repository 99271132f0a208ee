//! Throttling and retry logic for external calls
//!
//! Three distinct primitives live here, because their failure modes differ:
//!
//! - [`Throttle`]: randomized inter-request delay applied between items of a
//!   batch that actually hit the network, so bursts don't trip upstream rate
//!   limits. Cache/dedup hits are not throttled.
//! - [`retry_with_backoff`]: classified retry with linear backoff for a
//!   single network operation. Only transient errors are retried.
//! - [`poll_until`]: bounded polling against a server-side resolution job.
//!   Its failure mode is "the job never completes", which is not a transient
//!   network error, so it has its own attempt ceiling.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use rand::Rng;
use reqwest::{Client, Response};
use tracing::{debug, warn};

// ============================================================================
// Inter-download throttle
// ============================================================================

/// Randomized delay window applied after real downloads.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    min: Duration,
    max: Duration,
}

impl Throttle {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms.min(max_ms)),
            max: Duration::from_millis(max_ms.max(min_ms)),
        }
    }

    /// Pick a uniformly random delay in the configured window.
    pub fn pick_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let millis = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Sleep for a random delay in the window.
    pub async fn pause(&self) {
        let delay = self.pick_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Throttling before next download");
        tokio::time::sleep(delay).await;
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Whether an error is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, 429/5xx, connection reset, transient DNS trouble
    Retryable,
    /// Malformed URL, missing metadata, credential errors, everything else
    Permanent,
}

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Classify an error for retry purposes.
///
/// Typed reqwest errors are inspected directly; everything else falls back to
/// message patterns, since errors from external processes arrive as text.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(req_err) = cause.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() || req_err.is_connect() {
                return ErrorClass::Retryable;
            }
            if let Some(status) = req_err.status()
                && RETRYABLE_STATUS.contains(&status.as_u16())
            {
                return ErrorClass::Retryable;
            }
        }
    }

    let text = format!("{err:#}").to_lowercase();
    let transient = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "network unreachable",
        "temporary failure in name resolution",
        "dns error",
        "http 429",
        "http 500",
        "http 502",
        "http 503",
        "http 504",
        "status 429",
        "status 503",
        "too many requests",
    ];
    if transient.iter().any(|p| text.contains(p)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

// ============================================================================
// Classified retry with linear backoff
// ============================================================================

/// Re-invoke `op` while it fails with a retryable error and attempts remain,
/// sleeping `base_delay * attempt_number` between tries. A permanent error
/// aborts immediately without consuming the remaining attempts.
pub async fn retry_with_backoff<T, Fut, F>(
    op: F,
    max_attempts: u32,
    base_delay: Duration,
    operation_name: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if classify_error(&e) == ErrorClass::Permanent {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Permanent error, not retrying"
                    );
                    return Err(e);
                }
                if attempt >= max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = base_delay * attempt;
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ============================================================================
// Bounded polling
// ============================================================================

/// Poll `op` until it yields a value, up to `max_polls` attempts spaced
/// `interval` apart. Returns `Ok(None)` if the job never completed within the
/// ceiling; errors from `op` propagate immediately.
pub async fn poll_until<T, Fut, F>(op: F, max_polls: u32, interval: Duration) -> Result<Option<T>>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    for poll in 1..=max_polls.max(1) {
        if let Some(value) = op().await? {
            return Ok(Some(value));
        }
        if poll < max_polls {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(None)
}

// ============================================================================
// Rate-limited HTTP client
// ============================================================================

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

/// A rate-limited HTTP client wrapper shared by the provider adapters.
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: String,
}

impl RateLimitedClient {
    pub fn new(name: &str, config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            limiter: Arc::new(RateLimiter::direct(quota)),
            name: name.to_string(),
        }
    }

    /// Catalog provider APIs tolerate a couple of requests per second.
    pub fn for_provider(name: &str) -> Self {
        Self::new(
            name,
            RateLimitConfig {
                requests_per_second: 2,
                burst_size: 5,
            },
        )
    }

    /// The cross-platform link resolver is strict; keep to one per second.
    pub fn for_link_resolution() -> Self {
        Self::new(
            "songlink",
            RateLimitConfig {
                requests_per_second: 1,
                burst_size: 1,
            },
        )
    }

    /// Wait for a rate limit permit, then GET with query parameters.
    pub async fn get_with_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        query: &T,
    ) -> Result<Response> {
        self.limiter.until_ready().await;
        debug!(client = %self.name, url = %url, "Making rate-limited GET request");

        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .context("HTTP request failed")
    }

    /// Wait for a rate limit permit, then GET with headers and query parameters.
    pub async fn get_with_headers_and_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        query: &T,
    ) -> Result<Response> {
        self.limiter.until_ready().await;
        debug!(client = %self.name, url = %url, "Making rate-limited GET request");

        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(*key, *value);
        }
        request.query(query).send().await.context("HTTP request failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn test_classify_transient_messages() {
        assert_eq!(
            classify_error(&anyhow::anyhow!("HTTP 503 Service Unavailable")),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("connection reset by peer")),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("request timed out after 30s")),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("Temporary failure in name resolution")),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_classify_permanent_messages() {
        assert_eq!(
            classify_error(&anyhow::anyhow!("unsupported URL")),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("no track metadata in response")),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("HTTP 401 Unauthorized")),
            ErrorClass::Permanent
        );
    }

    #[tokio::test]
    async fn test_retry_exhausts_with_increasing_delay() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("HTTP 503 Service Unavailable")) }
            },
            3,
            Duration::from_millis(20),
            "test-op",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Linear backoff: 20ms after attempt 1, 40ms after attempt 2
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_permanent_error_tried_exactly_once() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("unsupported URL")) }
            },
            5,
            Duration::from_millis(10),
            "test-op",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);

        let result = retry_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::anyhow!("HTTP 502 Bad Gateway"))
                    } else {
                        Ok(42)
                    }
                }
            },
            5,
            Duration::from_millis(1),
            "test-op",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_respects_ceiling() {
        let polls = AtomicU32::new(0);

        let result: Result<Option<u32>> = poll_until(
            || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            },
            4,
            Duration::from_millis(1),
        )
        .await;

        assert!(result.unwrap().is_none());
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_value() {
        let polls = AtomicU32::new(0);

        let result = poll_until(
            || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n >= 1).then_some("ready")) }
            },
            10,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(result.unwrap(), Some("ready"));
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_throttle_window() {
        let throttle = Throttle::new(100, 200);
        for _ in 0..50 {
            let d = throttle.pick_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }
}
