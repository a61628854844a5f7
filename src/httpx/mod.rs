//! Shared HTTP transport with per-host limits and retry
//!
//! All outbound requests go through one [`HttpPool`]: a tuned API client, a
//! separate streaming client with no total timeout, and a process-global
//! per-`(scheme, host)` semaphore. The semaphore matters because the
//! supervisor may run several sibling instances against the same provider,
//! and Xtream panels ban accounts that hammer them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::cloudflare;
use crate::netutil;

/// Response-header / connect budget for API calls
const HEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// Overall budget for conditional GETs (category bodies can be large)
const CONDITIONAL_GET_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle connection lifetime in the pool
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pooled connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 6;

/// Concurrent in-flight requests allowed per (scheme, host)
const PER_HOST_CONCURRENCY: usize = 8;

/// Default 403 sleep when the provider sends no Retry-After
const DEFAULT_403_BACKOFF: Duration = Duration::from_secs(5);

/// Error type for pool construction and retried requests
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
}

/// Retry policy for [`HttpPool::request_with_retry`]
///
/// Statuses 200/206/304 return immediately. 429 sleeps
/// `min(Retry-After, max_429)` with jitter. 403 is retried only when
/// `retry_403` is set (provider API policy; streams never opt in). 5xx
/// backs off exponentially. 884 and the remaining 4xx are returned as-is.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_403: bool,
    /// Cap on 429 Retry-After sleeps
    pub max_429: Duration,
    /// Cap on 403 sleeps
    pub max_403: Duration,
    /// Base for exponential 5xx backoff
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_403: false,
            max_429: Duration::from_secs(30),
            max_403: Duration::from_secs(10),
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// What to do with a status before the next attempt
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Done,
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Classify a response status for retry purposes
    fn disposition(
        &self,
        status: StatusCode,
        retry_after: Option<Duration>,
        attempt: u32,
    ) -> Disposition {
        match status.as_u16() {
            200 | 206 | 304 => Disposition::Done,
            // Cloudflare's made-up codes (e.g. 884) are never retryable
            _ if cloudflare::is_nonstandard_status(status) => Disposition::GiveUp,
            429 => {
                let base = retry_after.unwrap_or(self.max_429).min(self.max_429);
                Disposition::RetryAfter(with_jitter(base))
            }
            403 if self.retry_403 => {
                let base = retry_after.unwrap_or(DEFAULT_403_BACKOFF).min(self.max_403);
                Disposition::RetryAfter(with_jitter(base))
            }
            500..=599 => {
                let base = self.base_backoff * 2u32.saturating_pow(attempt);
                Disposition::RetryAfter(with_jitter(base))
            }
            // Remaining 4xx are never retried
            _ => Disposition::GiveUp,
        }
    }
}

/// Apply ±25% jitter to a delay
fn with_jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25);
    base.mul_f64(factor)
}

/// Parse a Retry-After header (seconds form only)
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Process-global per-host semaphores, shared by every pool instance
fn host_semaphores() -> &'static DashMap<String, Arc<Semaphore>> {
    static SEMAPHORES: OnceLock<DashMap<String, Arc<Semaphore>>> = OnceLock::new();
    SEMAPHORES.get_or_init(DashMap::new)
}

/// Shared HTTP transport
#[derive(Debug, Clone)]
pub struct HttpPool {
    api: Client,
    stream: Client,
}

impl HttpPool {
    /// Build the two shared clients
    ///
    /// The API client carries a response-header budget and an overall
    /// deadline sized for conditional GETs. The streaming client has a
    /// connect budget only: live streams stay open for hours.
    pub fn new(user_agent: &str) -> Result<Self, HttpError> {
        let api = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(HEADER_TIMEOUT)
            .timeout(CONDITIONAL_GET_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(HttpError::ClientBuild)?;

        // No read or total timeout: live streams stay open for hours and the
        // gateway enforces its own first-byte and dead-read deadlines.
        let stream = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(HEADER_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(HttpError::ClientBuild)?;

        Ok(Self { api, stream })
    }

    /// Client for long-lived stream bodies (no overall deadline)
    pub fn stream_client(&self) -> &Client {
        &self.stream
    }

    /// Client for API and guide fetches
    pub fn api_client(&self) -> &Client {
        &self.api
    }

    /// Acquire the per-host permit for a URL
    ///
    /// Every outbound call holds one of these for its duration.
    pub async fn host_permit(&self, url: &Url) -> OwnedSemaphorePermit {
        let key = format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.port_or_known_default().unwrap_or(0)
        );
        let semaphore = host_semaphores()
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_CONCURRENCY)))
            .clone();
        semaphore
            .acquire_owned()
            .await
            .expect("host semaphore never closed")
    }

    /// Send a request with the retry policy applied
    ///
    /// Each attempt rebuilds the request from method, URL, and headers, so
    /// only body-less requests are supported (everything the tuner sends
    /// upstream is a GET). On exhaustion the last response is returned.
    pub async fn request_with_retry(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        policy: &RetryPolicy,
    ) -> Result<Response, HttpError> {
        let _permit = self.host_permit(&url).await;

        let mut attempt = 0u32;
        loop {
            let result = self
                .api
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(source) => {
                    // Transport failures get the 5xx treatment
                    if attempt < policy.max_retries
                        && (source.is_timeout() || source.is_connect())
                    {
                        let delay = with_jitter(policy.base_backoff * 2u32.saturating_pow(attempt));
                        tracing::debug!(
                            url = %netutil::redact(url.as_str()),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transport error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request {
                        url: netutil::redact(url.as_str()),
                        source,
                    });
                }
            };

            let retry_after = parse_retry_after(response.headers());
            match policy.disposition(response.status(), retry_after, attempt) {
                Disposition::Done | Disposition::GiveUp => return Ok(response),
                Disposition::RetryAfter(_) if attempt >= policy.max_retries => {
                    return Ok(response);
                }
                Disposition::RetryAfter(delay) => {
                    tracing::debug!(
                        url = %netutil::redact(url.as_str()),
                        status = response.status().as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after status"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    // =========================================================================
    // Disposition Tests
    // =========================================================================

    #[test]
    fn test_success_statuses_return_immediately() {
        let policy = RetryPolicy::default();
        for code in [200, 206, 304] {
            assert_eq!(
                policy.disposition(status(code), None, 0),
                Disposition::Done,
                "{} should be terminal",
                code
            );
        }
    }

    #[test]
    fn test_429_retries_with_capped_retry_after() {
        let policy = RetryPolicy::default();
        let disposition =
            policy.disposition(status(429), Some(Duration::from_secs(600)), 0);
        match disposition {
            Disposition::RetryAfter(delay) => {
                // 600s capped to max_429 (30s), ±25% jitter
                assert!(delay <= policy.max_429.mul_f64(1.25));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_403_retried_only_when_enabled() {
        let mut policy = RetryPolicy::default();

        assert_eq!(policy.disposition(status(403), None, 0), Disposition::GiveUp);

        policy.retry_403 = true;
        assert!(matches!(
            policy.disposition(status(403), None, 0),
            Disposition::RetryAfter(_)
        ));
    }

    #[test]
    fn test_884_never_retried() {
        let mut policy = RetryPolicy::default();
        policy.retry_403 = true;
        assert_eq!(policy.disposition(status(884), None, 0), Disposition::GiveUp);
    }

    #[test]
    fn test_5xx_backs_off_exponentially() {
        let policy = RetryPolicy::default();
        let d0 = match policy.disposition(status(500), None, 0) {
            Disposition::RetryAfter(d) => d,
            other => panic!("expected retry, got {:?}", other),
        };
        let d3 = match policy.disposition(status(503), None, 3) {
            Disposition::RetryAfter(d) => d,
            other => panic!("expected retry, got {:?}", other),
        };
        // 2^3 growth dominates the ±25% jitter band
        assert!(d3 > d0 * 4);
    }

    #[test]
    fn test_plain_4xx_not_retried() {
        let policy = RetryPolicy::default();
        for code in [400, 404, 410] {
            assert_eq!(
                policy.disposition(status(code), None, 0),
                Disposition::GiveUp,
                "{} should not retry",
                code
            );
        }
    }

    // =========================================================================
    // Helper Tests
    // =========================================================================

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_missing_or_http_date() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_jitter_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= base.mul_f64(0.74));
            assert!(jittered <= base.mul_f64(1.26));
        }
    }
}
