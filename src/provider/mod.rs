//! Provider probing and ranking
//!
//! IPTV subscriptions come with a handful of redundant base URLs, and not
//! all of them are equal: some are dead, some are Cloudflare-proxied (which
//! makes them useless for streaming, see [`crate::cloudflare`]), and the
//! rest differ in latency. The prober classifies every candidate and ranks
//! the usable ones so the fetcher indexes against the fastest base and
//! attaches the others as per-channel backups.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use url::Url;

use crate::cloudflare;
use crate::httpx::HttpPool;
use crate::netutil;
use crate::xtream::XtreamClient;

/// Error types for provider probing
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No usable provider base: {0}")]
    NoUsableBase(String),

    #[error("Invalid provider URL: {0}")]
    InvalidUrl(String),

    /// A candidate base serves through Cloudflare; indexing against this
    /// provider would produce brittle stream URLs, so the run is refused
    #[error("Cloudflare detected on a provider base")]
    CloudflareDetected,
}

/// Classification of one candidate base
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Authenticated probe succeeded; latency of the `player_api` round trip
    Ok { latency: Duration },
    /// Response carried Cloudflare markers
    Cloudflare,
    /// Dead, unauthenticated, or malformed
    Failed(String),
}

/// One probed candidate
#[derive(Debug, Clone)]
pub struct ProbedBase {
    pub base: Url,
    pub outcome: ProbeOutcome,
    /// The playlist endpoint answered with a well-formed M3U
    pub playlist_ok: bool,
}

/// Result of ranking all candidates
#[derive(Debug, Clone)]
pub struct RankedProviders {
    /// Bases whose `player_api` probe was OK, ascending latency
    pub api_bases: Vec<Url>,
    /// First base whose playlist endpoint was OK (used when `api_bases` is empty)
    pub playlist_fallback: Option<Url>,
}

impl RankedProviders {
    /// The base used for indexing, API bases preferred
    pub fn primary(&self) -> Option<&Url> {
        self.api_bases.first().or(self.playlist_fallback.as_ref())
    }

    /// All usable bases in rank order (primary first)
    pub fn all_bases(&self) -> Vec<Url> {
        if self.api_bases.is_empty() {
            self.playlist_fallback.iter().cloned().collect()
        } else {
            self.api_bases.clone()
        }
    }
}

/// Probes candidate provider bases
pub struct Prober {
    pool: HttpPool,
    probe_timeout: Duration,
}

impl Prober {
    pub fn new(pool: HttpPool, probe_timeout: Duration) -> Self {
        Self {
            pool,
            probe_timeout,
        }
    }

    /// Probe every candidate base and rank the usable ones
    ///
    /// All probes run concurrently. Returns `ProviderError::NoUsableBase`
    /// when neither an API base nor a playlist fallback answered.
    pub async fn rank(
        &self,
        bases: &[String],
        username: &str,
        password: &str,
    ) -> Result<RankedProviders, ProviderError> {
        let probes = bases.iter().map(|base| self.probe_base(base, username, password));
        let probed: Vec<ProbedBase> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        if let Some(cf) = probed
            .iter()
            .find(|p| p.outcome == ProbeOutcome::Cloudflare)
        {
            tracing::error!(
                base = %netutil::redact(cf.base.as_str()),
                "provider base is Cloudflare-proxied, refusing the run"
            );
            return Err(ProviderError::CloudflareDetected);
        }

        let mut ok: Vec<(&ProbedBase, Duration)> = probed
            .iter()
            .filter_map(|p| match p.outcome {
                ProbeOutcome::Ok { latency } => Some((p, latency)),
                _ => None,
            })
            .collect();
        ok.sort_by_key(|(_, latency)| *latency);

        for p in &probed {
            match &p.outcome {
                ProbeOutcome::Ok { latency } => tracing::info!(
                    base = %netutil::redact(p.base.as_str()),
                    latency_ms = latency.as_millis() as u64,
                    "provider base OK"
                ),
                ProbeOutcome::Cloudflare => tracing::warn!(
                    base = %netutil::redact(p.base.as_str()),
                    "provider base is Cloudflare-proxied, refusing"
                ),
                ProbeOutcome::Failed(reason) => tracing::warn!(
                    base = %netutil::redact(p.base.as_str()),
                    reason = %reason,
                    "provider base failed probe"
                ),
            }
        }

        let api_bases: Vec<Url> = ok.iter().map(|(p, _)| p.base.clone()).collect();
        let playlist_fallback = if api_bases.is_empty() {
            probed
                .iter()
                .find(|p| p.playlist_ok && p.outcome != ProbeOutcome::Cloudflare)
                .map(|p| p.base.clone())
        } else {
            None
        };

        if api_bases.is_empty() && playlist_fallback.is_none() {
            return Err(ProviderError::NoUsableBase(format!(
                "{} candidate(s) probed, none usable",
                bases.len()
            )));
        }

        Ok(RankedProviders {
            api_bases,
            playlist_fallback,
        })
    }

    /// Probe a single base: authenticated `player_api` plus playlist check
    async fn probe_base(
        &self,
        base: &str,
        username: &str,
        password: &str,
    ) -> Option<ProbedBase> {
        let parsed = match netutil::validate_url(base) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(base = %netutil::redact(base), error = %e, "skipping invalid provider URL");
                return None;
            }
        };

        // Probes are single-shot: a base that needs retries is not a base
        // worth ranking first.
        let policy = crate::httpx::RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        let client = XtreamClient::new(
            self.pool.clone(),
            parsed.as_str(),
            username,
            password,
            policy,
        )
        .ok()?;

        let outcome = self.probe_player_api(&client).await;
        let playlist_ok = match outcome {
            // API already proved the base; skip the second request
            ProbeOutcome::Ok { .. } => true,
            ProbeOutcome::Cloudflare => false,
            ProbeOutcome::Failed(_) => self.probe_playlist(&client).await,
        };

        Some(ProbedBase {
            base: parsed,
            outcome,
            playlist_ok,
        })
    }

    /// Authenticated `player_api.php` probe, classified per §Cloudflare rules
    async fn probe_player_api(&self, client: &XtreamClient) -> ProbeOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(self.probe_timeout, client.authenticate()).await;
        let latency = started.elapsed();

        match result {
            // A 200 that parses can still be CF-fronted; the markers decide
            Ok(Ok(probe)) if probe.cloudflare => ProbeOutcome::Cloudflare,
            Ok(Ok(_)) => ProbeOutcome::Ok { latency },
            Ok(Err(crate::xtream::XtreamError::Cloudflare)) => ProbeOutcome::Cloudflare,
            Ok(Err(crate::xtream::XtreamError::HttpError(status))) => {
                // Non-JSON interstitials: one plain GET to look for markers
                if self.base_has_cf_markers(client).await {
                    ProbeOutcome::Cloudflare
                } else {
                    ProbeOutcome::Failed(format!("status {}", status))
                }
            }
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::Failed("probe timeout".to_string()),
        }
    }

    /// One plain GET against the base to inspect response headers for CF
    async fn base_has_cf_markers(&self, client: &XtreamClient) -> bool {
        let response = self
            .pool
            .api_client()
            .get(client.base().clone())
            .timeout(self.probe_timeout)
            .send()
            .await;

        match response {
            Ok(response) => cloudflare::detect_cloudflare(response.status(), response.headers()),
            Err(_) => false,
        }
    }

    /// Check the `get.php` playlist endpoint for a well-formed M3U head
    async fn probe_playlist(&self, client: &XtreamClient) -> bool {
        let url = client.playlist_url();
        let response = self
            .pool
            .stream_client()
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await;

        let Ok(response) = response else {
            return false;
        };
        if response.status() != StatusCode::OK {
            return false;
        }
        if cloudflare::detect_cloudflare(response.status(), response.headers()) {
            return false;
        }

        // Only the first chunk is needed to recognise a playlist
        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;
        match tokio::time::timeout(self.probe_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk.starts_with(b"#EXTM3U"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(api: &[&str], fallback: Option<&str>) -> RankedProviders {
        RankedProviders {
            api_bases: api.iter().map(|u| Url::parse(u).unwrap()).collect(),
            playlist_fallback: fallback.map(|u| Url::parse(u).unwrap()),
        }
    }

    #[test]
    fn test_primary_prefers_api_bases() {
        let providers = ranked(
            &["http://fast.example/", "http://slow.example/"],
            None,
        );
        assert_eq!(providers.primary().unwrap().as_str(), "http://fast.example/");
    }

    #[test]
    fn test_primary_falls_back_to_playlist() {
        let providers = ranked(&[], Some("http://playlist.example/"));
        assert_eq!(
            providers.primary().unwrap().as_str(),
            "http://playlist.example/"
        );
    }

    #[test]
    fn test_all_bases_rank_order() {
        let providers = ranked(
            &["http://a.example/", "http://b.example/"],
            None,
        );
        let bases: Vec<String> = providers.all_bases().iter().map(|u| u.to_string()).collect();
        assert_eq!(bases, vec!["http://a.example/", "http://b.example/"]);
    }

    #[test]
    fn test_no_base_is_empty() {
        let providers = ranked(&[], None);
        assert!(providers.primary().is_none());
        assert!(providers.all_bases().is_empty());
    }
}
