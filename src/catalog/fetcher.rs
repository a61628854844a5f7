//! Conditional-GET catalog fetch pipeline
//!
//! One run: rank the provider bases, load the checkpointed fetch state,
//! fetch the category list, issue category-parallel conditional GETs,
//! persist each category checkpoint as it completes, assemble channels
//! (reusing the prior catalog for skipped categories), probe a sample for
//! Cloudflare, apply filters, fan the stream path across the ranked bases,
//! and persist the snapshot. A failed category is logged and retried next
//! run; Cloudflare and a provider-key mismatch are fatal to the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use url::Url;

use super::filters;
use super::model::{CatalogError, CatalogSnapshot, LiveChannel, VodEntry, VodKind};
use super::state::{content_hash, FetchState};
use super::store;
use crate::cloudflare;
use crate::config::Config;
use crate::httpx::{HttpError, HttpPool, RetryPolicy};
use crate::netutil;
use crate::playlist::{self, PlaylistError};
use crate::provider::{Prober, ProviderError, RankedProviders};
use crate::smoketest::Smoketester;
use crate::xtream::types::{Category, LiveStream};
use crate::xtream::{quality, XtreamClient, XtreamError};

/// How many stream URLs the Cloudflare sample probe inspects
const CF_SAMPLE_MAX: usize = 5;

/// Error types for catalog fetch runs
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// A provider base or sampled stream URL serves through Cloudflare
    #[error("Cloudflare detected; refusing to index this provider")]
    CloudflareDetected,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Xtream(#[from] XtreamError),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("HTTP status {0} fetching playlist")]
    PlaylistStatus(u16),

    #[error("No playlist URL configured")]
    NoPlaylist,
}

/// Result of one fetch run
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// The freshly built snapshot; `None` when nothing changed
    pub snapshot: Option<Arc<CatalogSnapshot>>,
    /// True when the content hash matched and no new catalog was built
    pub not_modified: bool,
    pub cats_total: usize,
    pub cats_skipped: usize,
    pub cats_failed: usize,
    pub channels_new: usize,
    pub channels_changed: usize,
    pub channels_unchanged: usize,
}

/// Per-category fetch result, consumed in arrival order
enum CategoryOutcome {
    /// 304 or matching content hash
    Skipped,
    Fetched(Vec<LiveStream>),
    Failed,
}

/// Runs the fetch pipeline
pub struct CatalogFetcher {
    config: Arc<Config>,
    pool: HttpPool,
}

impl CatalogFetcher {
    pub fn new(config: Arc<Config>, pool: HttpPool) -> Self {
        Self { config, pool }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            retry_403: self.config.retry_403,
            ..Default::default()
        }
    }

    /// Run one full fetch
    pub async fn fetch(&self) -> Result<FetchOutcome, FetchError> {
        let playlist_only = self.config.provider_urls.is_empty()
            || (self.config.live_only && self.config.playlist_url.is_some());

        if playlist_only {
            let url_str = self
                .config
                .playlist_url
                .as_ref()
                .ok_or(FetchError::NoPlaylist)?;
            let url = netutil::validate_url(url_str)
                .map_err(|e| ProviderError::InvalidUrl(e.to_string()))?;
            return self.fetch_playlist(url).await;
        }

        self.fetch_xtream().await
    }

    // =========================================================================
    // Xtream path
    // =========================================================================

    async fn fetch_xtream(&self) -> Result<FetchOutcome, FetchError> {
        let prober = Prober::new(
            self.pool.clone(),
            Duration::from_millis(self.config.probe_timeout_ms),
        );
        let ranked = prober
            .rank(
                &self.config.provider_urls,
                &self.config.provider_user,
                &self.config.provider_pass,
            )
            .await
            .map_err(|e| match e {
                ProviderError::CloudflareDetected => FetchError::CloudflareDetected,
                other => FetchError::Provider(other),
            })?;

        // No API base answered: fall back to the first working playlist endpoint
        if ranked.api_bases.is_empty() {
            let base = ranked
                .playlist_fallback
                .clone()
                .expect("rank() errors when nothing is usable");
            tracing::warn!(
                base = %netutil::redact(base.as_str()),
                "no player_api base usable, falling back to playlist endpoint"
            );
            let client = self.client_for(&base)?;
            return self.fetch_playlist(client.playlist_url()).await;
        }

        let primary = ranked.api_bases[0].clone();
        let client = self.client_for(&primary)?;

        let provider_key =
            FetchState::provider_key_for(primary.as_str(), &self.config.provider_user);
        let state_path = self.config.fetch_state_path();
        let state = FetchState::load(&state_path, &provider_key).await;
        let prior_hash = state.content_hash.clone();
        let prior_catalog = store::load(&self.config.catalog_path()).await.ok().flatten();

        let categories = client.get_live_categories().await?;
        let mut outcome = FetchOutcome {
            cats_total: categories.len(),
            ..Default::default()
        };

        let shared_state = Arc::new(tokio::sync::Mutex::new(state));
        let results = self
            .fetch_categories(&client, &categories, &shared_state, &state_path, &mut outcome)
            .await?;

        // Top-level short-circuit: all categories unchanged and nothing failed
        let mut state = shared_state.lock().await.clone();
        let combined = state.combined_content_hash();
        let unchanged = prior_hash.as_deref() == Some(combined.as_str())
            && outcome.cats_failed == 0
            && prior_catalog.is_some()
            && outcome.cats_skipped == outcome.cats_total;
        if unchanged {
            tracing::info!("catalog content hash unchanged, keeping current catalog");
            outcome.not_modified = true;
            return Ok(outcome);
        }

        // Assemble in category order, reusing the prior catalog where skipped
        let mut channels: Vec<LiveChannel> = Vec::new();
        let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        for category in &categories {
            match results.get(&category.category_id) {
                Some(CategoryOutcome::Fetched(streams)) => {
                    for stream in streams {
                        let channel = self.build_xtream_channel(
                            &client,
                            &ranked,
                            category,
                            stream,
                        );
                        if seen_ids.insert(channel.channel_id.clone()) {
                            channels.push(channel);
                        } else {
                            tracing::warn!(
                                channel_id = %channel.channel_id,
                                "duplicate stream id across categories, keeping first"
                            );
                        }
                    }
                }
                Some(CategoryOutcome::Skipped) | Some(CategoryOutcome::Failed) | None => {
                    if let Some(prior) = &prior_catalog {
                        for channel in prior
                            .channels()
                            .iter()
                            .filter(|c| c.category_id == Some(category.category_id))
                        {
                            if seen_ids.insert(channel.channel_id.clone()) {
                                channels.push(channel.clone());
                            }
                        }
                    }
                }
            }
        }

        // VOD is carried alongside but never blocks the run
        let (movies, series) = self.fetch_vod(&client).await;

        self.finish_run(
            channels,
            movies,
            series,
            &mut state,
            &state_path,
            combined,
            Some(primary),
            outcome,
        )
        .await
    }

    /// Category-parallel conditional fetch with per-category checkpointing
    async fn fetch_categories(
        &self,
        client: &XtreamClient,
        categories: &[Category],
        shared_state: &Arc<tokio::sync::Mutex<FetchState>>,
        state_path: &std::path::Path,
        outcome: &mut FetchOutcome,
    ) -> Result<HashMap<i64, CategoryOutcome>, FetchError> {
        let mut results: HashMap<i64, CategoryOutcome> = HashMap::new();

        let mut in_flight = futures_util::stream::iter(categories.iter().cloned().map(|category| {
            let client = client.clone();
            let state = shared_state.clone();
            async move {
                let key = category.category_id.to_string();
                let (etag, last_modified, prior_hash) = {
                    let state = state.lock().await;
                    match state.categories.get(&key) {
                        Some(c) => (
                            c.etag.clone(),
                            c.last_modified.clone(),
                            c.content_hash.clone(),
                        ),
                        None => (None, None, None),
                    }
                };

                let fetched = client
                    .fetch_live_streams_conditional(
                        category.category_id,
                        etag.as_deref(),
                        last_modified.as_deref(),
                    )
                    .await;
                (category, prior_hash, fetched)
            }
        }))
        .buffer_unordered(self.config.category_workers);

        while let Some((category, prior_hash, fetched)) = in_flight.next().await {
            let key = category.category_id.to_string();
            let category_outcome = match fetched {
                Ok(crate::xtream::client::ConditionalBody::NotModified) => {
                    outcome.cats_skipped += 1;
                    let mut state = shared_state.lock().await;
                    let entry = state.category_mut(&key);
                    entry.complete = true;
                    entry.fetched_at = Some(Utc::now());
                    CategoryOutcome::Skipped
                }
                Ok(crate::xtream::client::ConditionalBody::Fetched {
                    body,
                    etag,
                    last_modified,
                    cloudflare,
                }) => {
                    if cloudflare {
                        return Err(FetchError::CloudflareDetected);
                    }
                    let body_hash = content_hash(&body);
                    if prior_hash.as_deref() == Some(body_hash.as_str()) {
                        outcome.cats_skipped += 1;
                        let mut state = shared_state.lock().await;
                        let entry = state.category_mut(&key);
                        entry.etag = etag;
                        entry.last_modified = last_modified;
                        entry.complete = true;
                        entry.fetched_at = Some(Utc::now());
                        CategoryOutcome::Skipped
                    } else {
                        match XtreamClient::parse_live_streams(&body) {
                            Ok(streams) => {
                                let mut state = shared_state.lock().await;
                                let entry = state.category_mut(&key);
                                let mut hashes = HashMap::with_capacity(streams.len());
                                for stream in &streams {
                                    let id = stream.stream_id.to_string();
                                    let hash = stream_hash(stream);
                                    match entry.stream_hashes.get(&id) {
                                        None => outcome.channels_new += 1,
                                        Some(prior) if prior != &hash => {
                                            outcome.channels_changed += 1
                                        }
                                        Some(_) => outcome.channels_unchanged += 1,
                                    }
                                    hashes.insert(id, hash);
                                }
                                entry.stream_hashes = hashes;
                                entry.etag = etag;
                                entry.last_modified = last_modified;
                                entry.content_hash = Some(body_hash);
                                entry.complete = true;
                                entry.fetched_at = Some(Utc::now());
                                CategoryOutcome::Fetched(streams)
                            }
                            Err(e) => {
                                outcome.cats_failed += 1;
                                tracing::warn!(
                                    category = %category.category_name,
                                    error = %e,
                                    "category body did not parse"
                                );
                                let mut state = shared_state.lock().await;
                                state.category_mut(&key).complete = false;
                                CategoryOutcome::Failed
                            }
                        }
                    }
                }
                Err(e) => {
                    outcome.cats_failed += 1;
                    tracing::warn!(
                        category = %category.category_name,
                        error = %e,
                        "category fetch failed, will retry next run"
                    );
                    let mut state = shared_state.lock().await;
                    state.category_mut(&key).complete = false;
                    CategoryOutcome::Failed
                }
            };

            // Crash-safe resume: checkpoint after every category
            {
                let state = shared_state.lock().await;
                if let Err(e) = state.persist(state_path).await {
                    tracing::warn!(error = %e, "failed to persist fetch state checkpoint");
                }
            }
            results.insert(category.category_id, category_outcome);
        }

        Ok(results)
    }

    fn build_xtream_channel(
        &self,
        client: &XtreamClient,
        ranked: &RankedProviders,
        category: &Category,
        stream: &LiveStream,
    ) -> LiveChannel {
        // Fan the authenticated stream path across every ranked base:
        // primary first, then backups
        let stream_urls: Vec<String> = ranked
            .all_bases()
            .iter()
            .map(|base| client.stream_url_on(base, stream.stream_id))
            .collect();
        let stream_url = stream_urls[0].clone();

        LiveChannel {
            channel_id: stream.stream_id.to_string(),
            guide_number: stream
                .num
                .map(|n| n.to_string())
                .unwrap_or_else(|| stream.stream_id.to_string()),
            guide_name: stream.name.clone(),
            stream_url,
            stream_urls,
            tvg_id: stream.epg_channel_id.clone().unwrap_or_default(),
            quality_tier: quality::detect_tier(&stream.name),
            group_title: Some(category.category_name.clone()),
            source_tag: None,
            category_id: Some(category.category_id),
        }
    }

    async fn fetch_vod(&self, client: &XtreamClient) -> (Vec<VodEntry>, Vec<VodEntry>) {
        if self.config.live_only {
            return (Vec::new(), Vec::new());
        }

        let movies = match client.get_vod_streams().await {
            Ok(streams) => streams
                .into_iter()
                .map(|s| VodEntry {
                    id: s.stream_id.to_string(),
                    name: s.name,
                    kind: VodKind::Movie,
                    category_id: s.category_id,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "VOD stream list fetch failed, continuing without");
                Vec::new()
            }
        };

        let series = match client.get_series().await {
            Ok(entries) => entries
                .into_iter()
                .map(|s| VodEntry {
                    id: s.series_id.to_string(),
                    name: s.name,
                    kind: VodKind::Series,
                    category_id: s.category_id,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "series list fetch failed, continuing without");
                Vec::new()
            }
        };

        (movies, series)
    }

    // =========================================================================
    // Playlist path
    // =========================================================================

    async fn fetch_playlist(&self, url: Url) -> Result<FetchOutcome, FetchError> {
        let mut identity = url.clone();
        identity.set_query(None);
        let provider_key =
            FetchState::provider_key_for(identity.as_str(), &self.config.provider_user);
        let state_path = self.config.fetch_state_path();
        let mut state = FetchState::load(&state_path, &provider_key).await;

        const PLAYLIST_KEY: &str = "playlist";
        let (etag, last_modified, prior_hash) = match state.categories.get(PLAYLIST_KEY) {
            Some(c) => (
                c.etag.clone(),
                c.last_modified.clone(),
                c.content_hash.clone(),
            ),
            None => (None, None, None),
        };

        let mut headers = HeaderMap::new();
        if let Some(etag) = &etag {
            if let Ok(value) = etag.parse() {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_modified) = &last_modified {
            if let Ok(value) = last_modified.parse() {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }

        let response = self
            .pool
            .request_with_retry(Method::GET, url.clone(), headers, &self.retry_policy())
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            // Body is nil and no content hash is touched
            tracing::info!("playlist not modified (304)");
            return Ok(FetchOutcome {
                not_modified: true,
                cats_total: 1,
                cats_skipped: 1,
                ..Default::default()
            });
        }

        if cloudflare::detect_cloudflare(response.status(), response.headers()) {
            return Err(FetchError::CloudflareDetected);
        }
        if !response.status().is_success() {
            return Err(FetchError::PlaylistStatus(response.status().as_u16()));
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let new_last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Streaming parse with the rolling-hash tee
        let parsed = playlist::parse_stream(response.bytes_stream()).await?;

        if prior_hash.as_deref() == Some(parsed.content_hash.as_str()) {
            tracing::info!("playlist content hash unchanged, keeping current catalog");
            let entry = state.category_mut(PLAYLIST_KEY);
            entry.etag = new_etag;
            entry.last_modified = new_last_modified;
            entry.fetched_at = Some(Utc::now());
            entry.complete = true;
            if let Err(e) = state.persist(&state_path).await {
                tracing::warn!(error = %e, "failed to persist fetch state");
            }
            return Ok(FetchOutcome {
                not_modified: true,
                cats_total: 1,
                cats_skipped: 1,
                ..Default::default()
            });
        }

        let mut channels: Vec<LiveChannel> = Vec::new();
        let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut outcome = FetchOutcome {
            cats_total: 1,
            ..Default::default()
        };

        let entry_count = parsed.entries.len();
        {
            let entry = state.category_mut(PLAYLIST_KEY);
            for (position, item) in parsed.entries.iter().enumerate() {
                if netutil::validate_url(&item.url).is_err() {
                    tracing::warn!(url = %netutil::redact(&item.url), "skipping non-http playlist entry");
                    continue;
                }
                let channel_id = playlist::channel_id_for_url(&item.url);
                if !seen_ids.insert(channel_id.clone()) {
                    continue;
                }

                let hash = content_hash(
                    format!("{}|{}|{}", item.name, item.url, item.tvg_id).as_bytes(),
                );
                match entry.stream_hashes.get(&channel_id) {
                    None => outcome.channels_new += 1,
                    Some(prior) if prior != &hash => outcome.channels_changed += 1,
                    Some(_) => outcome.channels_unchanged += 1,
                }
                entry.stream_hashes.insert(channel_id.clone(), hash);

                channels.push(LiveChannel {
                    channel_id,
                    guide_number: item
                        .tvg_chno
                        .clone()
                        .unwrap_or_else(|| (position + 1).to_string()),
                    guide_name: item.name.clone(),
                    stream_url: item.url.clone(),
                    stream_urls: vec![item.url.clone()],
                    tvg_id: item.tvg_id.clone(),
                    quality_tier: quality::detect_tier(&item.name),
                    group_title: item.group_title.clone(),
                    source_tag: None,
                    category_id: None,
                });
            }

            entry.etag = new_etag;
            entry.last_modified = new_last_modified;
            entry.content_hash = Some(parsed.content_hash.clone());
            entry.fetched_at = Some(Utc::now());
            entry.complete = true;
        }
        tracing::info!(entries = entry_count, channels = channels.len(), "playlist parsed");

        let combined = state.combined_content_hash();
        self.finish_run(
            channels,
            Vec::new(),
            Vec::new(),
            &mut state,
            &state_path,
            combined,
            None,
            outcome,
        )
        .await
    }

    // =========================================================================
    // Shared tail: CF sample probe, filters, snapshot, persistence
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn finish_run(
        &self,
        channels: Vec<LiveChannel>,
        movies: Vec<VodEntry>,
        series: Vec<VodEntry>,
        state: &mut FetchState,
        state_path: &std::path::Path,
        combined_hash: String,
        primary: Option<Url>,
        mut outcome: FetchOutcome,
    ) -> Result<FetchOutcome, FetchError> {
        self.cf_sample_probe(&channels).await?;

        let mut channels = channels;
        if self.config.epg_linked_only {
            channels = filters::epg_linked_only(channels);
        }
        let smoketester = Smoketester::new(
            self.pool.clone(),
            self.config.smoketest.clone(),
            self.config.smoketest_cache_path(),
        )
        .await;
        channels = smoketester.filter_channels(channels).await;
        channels = filters::dedup_by_quality(channels);

        let snapshot = CatalogSnapshot::new(channels, movies, series)?;
        store::save(&snapshot, &self.config.catalog_path()).await?;

        state.content_hash = Some(combined_hash);
        state.stream_base = primary.map(|mut base| {
            let _ = base.set_username("");
            let _ = base.set_password(None);
            base.to_string()
        });
        state.last_run_at = Some(Utc::now());
        state.runs += 1;
        if let Err(e) = state.persist(state_path).await {
            tracing::warn!(error = %e, "failed to persist fetch state");
        }

        tracing::info!(
            channels = snapshot.len(),
            cats_skipped = outcome.cats_skipped,
            cats_failed = outcome.cats_failed,
            new = outcome.channels_new,
            changed = outcome.channels_changed,
            "catalog fetch complete"
        );

        outcome.snapshot = Some(Arc::new(snapshot));
        Ok(outcome)
    }

    /// Probe a first/middle/last sample of stream URLs for Cloudflare
    ///
    /// Probe failures are ignored; only a positive detection is fatal.
    async fn cf_sample_probe(&self, channels: &[LiveChannel]) -> Result<(), FetchError> {
        let urls = sample_urls(channels, CF_SAMPLE_MAX);
        for url in urls {
            let response = self
                .pool
                .stream_client()
                .get(&url)
                .timeout(Duration::from_millis(self.config.probe_timeout_ms))
                .send()
                .await;

            if let Ok(response) = response {
                if cloudflare::detect_cloudflare(response.status(), response.headers()) {
                    tracing::error!(
                        url = %netutil::redact(&url),
                        "sampled stream URL is Cloudflare-proxied"
                    );
                    return Err(FetchError::CloudflareDetected);
                }
            }
        }
        Ok(())
    }

    fn client_for(&self, base: &Url) -> Result<XtreamClient, XtreamError> {
        XtreamClient::new(
            self.pool.clone(),
            base.as_str(),
            &self.config.provider_user,
            &self.config.provider_pass,
            self.retry_policy(),
        )
    }
}

/// Hash of the fields that make a channel "changed"
fn stream_hash(stream: &LiveStream) -> String {
    content_hash(
        format!(
            "{}|{}|{}|{}",
            stream.stream_id,
            stream.name,
            stream.epg_channel_id.as_deref().unwrap_or(""),
            stream.stream_icon.as_deref().unwrap_or("")
        )
        .as_bytes(),
    )
}

/// First, middle, last, then evenly spread until `max` URLs
fn sample_urls(channels: &[LiveChannel], max: usize) -> Vec<String> {
    if channels.is_empty() || max == 0 {
        return Vec::new();
    }

    let mut indices = vec![0, channels.len() / 2, channels.len() - 1];
    let step = (channels.len() / max).max(1);
    let mut i = step;
    while indices.len() < max && i < channels.len() {
        indices.push(i);
        i += step;
    }
    indices.sort_unstable();
    indices.dedup();
    indices.truncate(max);

    indices
        .into_iter()
        .map(|i| channels[i].stream_url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::test_channel;

    #[test]
    fn test_stream_hash_changes_with_name() {
        let a: LiveStream =
            serde_json::from_str(r#"{"stream_id":1,"name":"A"}"#).unwrap();
        let b: LiveStream =
            serde_json::from_str(r#"{"stream_id":1,"name":"B"}"#).unwrap();
        let a2: LiveStream =
            serde_json::from_str(r#"{"stream_id":1,"name":"A"}"#).unwrap();
        assert_ne!(stream_hash(&a), stream_hash(&b));
        assert_eq!(stream_hash(&a), stream_hash(&a2));
    }

    #[test]
    fn test_stream_hash_changes_with_tvg_id() {
        let a: LiveStream =
            serde_json::from_str(r#"{"stream_id":1,"name":"A","epg_channel_id":"X.uk"}"#)
                .unwrap();
        let b: LiveStream =
            serde_json::from_str(r#"{"stream_id":1,"name":"A","epg_channel_id":"Y.uk"}"#)
                .unwrap();
        assert_ne!(stream_hash(&a), stream_hash(&b));
    }

    #[test]
    fn test_sample_urls_small_catalog() {
        let channels = vec![test_channel("1", "http://h/1.ts")];
        assert_eq!(sample_urls(&channels, 5), vec!["http://h/1.ts"]);
        assert!(sample_urls(&[], 5).is_empty());
    }

    #[test]
    fn test_sample_urls_covers_first_middle_last() {
        let channels: Vec<LiveChannel> = (0..100)
            .map(|i| test_channel(&i.to_string(), &format!("http://h/{}.ts", i)))
            .collect();
        let sample = sample_urls(&channels, 5);
        assert!(sample.len() <= 5);
        assert!(sample.contains(&"http://h/0.ts".to_string()));
        assert!(sample.contains(&"http://h/50.ts".to_string()));
        assert!(sample.contains(&"http://h/99.ts".to_string()));
    }
}
