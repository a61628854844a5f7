//! Stream smoketesting
//!
//! Optionally probes a bounded random sample of stream URLs before they are
//! published in the lineup. Verdicts are cached on disk per URL with a TTL
//! so repeated refreshes don't hammer the provider, which counts probe
//! connections against the account limit like any other stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::write_atomic;
use crate::catalog::model::LiveChannel;
use crate::config::SmoketestConfig;
use crate::httpx::HttpPool;
use crate::netutil;

/// A cached probe verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Verdict {
    pub pass: bool,
    pub checked_at: DateTime<Utc>,
}

impl Verdict {
    fn is_fresh(&self, ttl_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.checked_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < ttl_secs
    }
}

/// Probes stream URLs and filters failing channels out of the catalog
pub struct Smoketester {
    pool: HttpPool,
    config: SmoketestConfig,
    cache_path: PathBuf,
    verdicts: Mutex<HashMap<String, Verdict>>,
}

impl Smoketester {
    /// Create a tester, loading prior verdicts from the cache file
    pub async fn new(pool: HttpPool, config: SmoketestConfig, cache_path: PathBuf) -> Self {
        let verdicts = match tokio::fs::read(&cache_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            pool,
            config,
            cache_path,
            verdicts: Mutex::new(verdicts),
        }
    }

    /// Drop channels whose primary stream fails a probe
    ///
    /// Only a bounded random sample is probed per run; unsampled channels
    /// pass through. Channels with a fresh cached fail are dropped without
    /// a new probe.
    pub async fn filter_channels(&self, channels: Vec<LiveChannel>) -> Vec<LiveChannel> {
        if !self.config.enabled || channels.is_empty() {
            return channels;
        }

        // Split by cached verdicts first
        let mut need_probe: Vec<String> = Vec::new();
        {
            let verdicts = self.verdicts.lock().await;
            for channel in &channels {
                match verdicts.get(&channel.stream_url) {
                    Some(v) if v.is_fresh(self.config.ttl_secs) => {}
                    _ => need_probe.push(channel.stream_url.clone()),
                }
            }
        }

        // Bounded random sample of the un-cached URLs
        need_probe.shuffle(&mut rand::thread_rng());
        need_probe.truncate(self.config.max_channels);

        let probe_timeout = Duration::from_millis(self.config.timeout_ms);
        let read_budget = Duration::from_millis(self.config.max_duration_ms);

        let results: Vec<(String, bool)> = futures_util::stream::iter(need_probe)
            .map(|url| {
                let pool = self.pool.clone();
                async move {
                    let pass = probe_stream(&pool, &url, probe_timeout, read_budget).await;
                    (url, pass)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut failed = 0usize;
        {
            let mut verdicts = self.verdicts.lock().await;
            for (url, pass) in results {
                if !pass {
                    failed += 1;
                    tracing::warn!(url = %netutil::redact(&url), "smoketest failed");
                }
                verdicts.insert(
                    url,
                    Verdict {
                        pass,
                        checked_at: Utc::now(),
                    },
                );
            }
        }
        if failed > 0 {
            tracing::info!(failed, "smoketest dropped failing streams");
        }

        self.persist().await;

        let verdicts = self.verdicts.lock().await;
        channels
            .into_iter()
            .filter(|channel| {
                match verdicts.get(&channel.stream_url) {
                    Some(v) if v.is_fresh(self.config.ttl_secs) => v.pass,
                    // Never probed (outside the sample): keep
                    _ => true,
                }
            })
            .collect()
    }

    async fn persist(&self) {
        let verdicts = self.verdicts.lock().await;
        if let Ok(encoded) = serde_json::to_vec_pretty(&*verdicts) {
            if let Err(e) = write_atomic(&self.cache_path, &encoded).await {
                tracing::warn!(error = %e, "failed to persist smoketest cache");
            }
        }
    }
}

/// Probe one stream URL: connect, expect 2xx, read at least one chunk
async fn probe_stream(
    pool: &HttpPool,
    url: &str,
    probe_timeout: Duration,
    read_budget: Duration,
) -> bool {
    let request = pool.stream_client().get(url).timeout(probe_timeout);
    let response = match request.send().await {
        Ok(response) => response,
        Err(_) => return false,
    };

    if !response.status().is_success() {
        return false;
    }
    if response.content_length() == Some(0) {
        return false;
    }

    let mut body = response.bytes_stream();
    matches!(
        tokio::time::timeout(read_budget, body.next()).await,
        Ok(Some(Ok(chunk))) if !chunk.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::test_channel;

    fn test_config(enabled: bool) -> SmoketestConfig {
        SmoketestConfig {
            enabled,
            ttl_secs: 3600,
            timeout_ms: 500,
            concurrency: 2,
            max_channels: 10,
            max_duration_ms: 500,
        }
    }

    #[test]
    fn test_verdict_freshness() {
        let fresh = Verdict {
            pass: true,
            checked_at: Utc::now(),
        };
        assert!(fresh.is_fresh(60));

        let stale = Verdict {
            pass: true,
            checked_at: Utc::now() - chrono::Duration::seconds(120),
        };
        assert!(!stale.is_fresh(60));
    }

    #[tokio::test]
    async fn test_disabled_passes_everything_through() {
        let dir = tempfile::tempdir().unwrap();
        let tester = Smoketester::new(
            HttpPool::new("test").unwrap(),
            test_config(false),
            dir.path().join("cache.json"),
        )
        .await;

        let channels = vec![test_channel("1", "http://192.0.2.1:1/dead.ts")];
        let kept = tester.filter_channels(channels).await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_cached_fail_drops_channel_without_probe() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");

        let mut verdicts = HashMap::new();
        verdicts.insert(
            "http://dead.example/1.ts".to_string(),
            Verdict {
                pass: false,
                checked_at: Utc::now(),
            },
        );
        tokio::fs::write(&cache_path, serde_json::to_vec(&verdicts).unwrap())
            .await
            .unwrap();

        let tester = Smoketester::new(
            HttpPool::new("test").unwrap(),
            test_config(true),
            cache_path,
        )
        .await;

        let channels = vec![
            test_channel("1", "http://dead.example/1.ts"),
        ];
        // The only candidate is cache-failed, so no network probe happens
        let kept = tester.filter_channels(channels).await;
        assert!(kept.is_empty());
    }
}
