//! Integration tests for the catalog fetch pipeline
//!
//! Mock Xtream panels and playlist origins run as local axum servers; the
//! fetcher is driven directly and observed through its outcome counters
//! and the HTTP calls the mocks record.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use common::{start_mock_server, test_config};
use tunerforge_lib::catalog::{CatalogFetcher, FetchError};
use tunerforge_lib::httpx::HttpPool;

fn auth_ok() -> serde_json::Value {
    serde_json::json!({
        "user_info": {
            "username": "user",
            "auth": 1,
            "status": "Active",
            "max_connections": "2",
            "active_cons": "0"
        },
        "server_info": {"url": "mock", "port": "80"}
    })
}

#[derive(Default)]
struct XtreamMockState {
    category_calls: AtomicUsize,
}

/// Mock Xtream panel: two categories, one stream each, honouring
/// If-None-Match on the second fetch of every category
fn xtream_mock(state: Arc<XtreamMockState>) -> Router {
    async fn player_api(
        State(state): State<Arc<XtreamMockState>>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        match params.get("action").map(String::as_str) {
            None => Json(auth_ok()).into_response(),
            Some("get_live_categories") => Json(serde_json::json!([
                {"category_id": "1", "category_name": "Sports"},
                {"category_id": "2", "category_name": "News"}
            ]))
            .into_response(),
            Some("get_live_streams") => {
                state.category_calls.fetch_add(1, Ordering::SeqCst);
                let category = params.get("category_id").cloned().unwrap_or_default();
                let etag = format!("\"cat-{}\"", category);

                let matches = headers
                    .get(header::IF_NONE_MATCH)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == etag)
                    .unwrap_or(false);
                if matches {
                    return StatusCode::NOT_MODIFIED.into_response();
                }

                let stream_id = 100 + category.parse::<i64>().unwrap_or(0);
                let body = serde_json::json!([{
                    "stream_id": stream_id,
                    "name": format!("Stream {}", stream_id),
                    "epg_channel_id": format!("ch{}.uk", stream_id),
                    "category_id": category
                }]);
                ([(header::ETAG, etag)], Json(body)).into_response()
            }
            Some(_) => Json(serde_json::json!([])).into_response(),
        }
    }

    async fn live_bytes() -> impl IntoResponse {
        vec![0x47u8; 376]
    }

    Router::new()
        .route("/player_api.php", get(player_api))
        .route("/live/{user}/{pass}/{id}", get(live_bytes))
        .with_state(state)
}

#[tokio::test]
async fn test_category_parallel_mixed_fetch_skips_on_second_run() {
    let mock_state = Arc::new(XtreamMockState::default());
    let upstream = start_mock_server(xtream_mock(mock_state.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.provider_urls = vec![format!("http://{}", upstream)];
    config.live_only = true;

    let fetcher = CatalogFetcher::new(
        Arc::new(config),
        HttpPool::new("tunerforge-test").unwrap(),
    );

    // First run fetches both categories
    let first = fetcher.fetch().await.unwrap();
    let snapshot = first.snapshot.expect("first run builds a catalog");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(first.cats_skipped, 0);
    assert_eq!(first.channels_new, 2);
    assert!(snapshot.get("101").is_some());
    assert!(snapshot.get("102").is_some());

    // Backup URL fan-out: single base means a single entry, primary first
    let channel = snapshot.get("101").unwrap();
    assert_eq!(channel.stream_urls[0], channel.stream_url);
    assert!(channel.stream_url.contains("/live/user/pass/101.ts"));

    // Second run: both categories answer 304
    let second = fetcher.fetch().await.unwrap();
    assert_eq!(second.cats_skipped, 2);
    assert!(second.not_modified);
    assert!(second.snapshot.is_none(), "unchanged fetch must not rebuild");

    assert_eq!(mock_state.category_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cloudflare_base_is_fatal_and_catalog_untouched() {
    async fn cf_player_api() -> Response {
        ([("cf-ray", "abc-FRA")], Json(auth_ok())).into_response()
    }
    let router = Router::new().route("/player_api.php", get(cf_player_api));
    let upstream = start_mock_server(router).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.provider_urls = vec![format!("http://{}", upstream)];
    let catalog_path = config.catalog_path();

    let fetcher = CatalogFetcher::new(
        Arc::new(config),
        HttpPool::new("tunerforge-test").unwrap(),
    );

    let result = fetcher.fetch().await;
    assert!(matches!(result, Err(FetchError::CloudflareDetected)));
    assert!(!catalog_path.exists(), "no catalog may be written");
}

#[derive(Default)]
struct PlaylistMockState {
    calls: AtomicUsize,
    conditional_seen: AtomicUsize,
}

fn playlist_mock(state: Arc<PlaylistMockState>, stream_base: String) -> Router {
    async fn playlist(
        State((state, stream_base)): State<(Arc<PlaylistMockState>, String)>,
        headers: HeaderMap,
    ) -> Response {
        state.calls.fetch_add(1, Ordering::SeqCst);

        let matches = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "\"e1\"")
            .unwrap_or(false);
        if matches {
            state.conditional_seen.fetch_add(1, Ordering::SeqCst);
            return StatusCode::NOT_MODIFIED.into_response();
        }

        let body = format!(
            "#EXTM3U\n#EXTINF:-1 tvg-id=\"BBC1.uk\" tvg-chno=\"101\",BBC One\n{}/live/u/p/1234.ts\n",
            stream_base
        );
        ([(header::ETAG, "\"e1\"")], body).into_response()
    }

    async fn live_bytes() -> impl IntoResponse {
        vec![0x47u8; 376]
    }

    Router::new()
        .route("/playlist.m3u", get(playlist))
        .route("/live/{user}/{pass}/{id}", get(live_bytes))
        .with_state((state, stream_base))
}

#[tokio::test]
async fn test_playlist_304_fast_path() {
    let mock_state = Arc::new(PlaylistMockState::default());

    // The playlist's stream URLs point back at the same mock
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = playlist_mock(mock_state.clone(), format!("http://{}", addr));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.playlist_url = Some(format!("http://{}/playlist.m3u", addr));

    let fetcher = CatalogFetcher::new(
        Arc::new(config),
        HttpPool::new("tunerforge-test").unwrap(),
    );

    // First run downloads and indexes the playlist
    let first = fetcher.fetch().await.unwrap();
    let snapshot = first.snapshot.expect("first run builds a catalog");
    assert_eq!(snapshot.len(), 1);
    let channel = snapshot.get("1234").unwrap();
    assert_eq!(channel.tvg_id, "BBC1.uk");
    assert_eq!(channel.guide_number, "101");

    // Second run sends If-None-Match: "e1" and gets the 304 fast path
    let second = fetcher.fetch().await.unwrap();
    assert!(second.not_modified);
    assert!(second.snapshot.is_none());

    assert_eq!(
        mock_state.calls.load(Ordering::SeqCst),
        2,
        "exactly two playlist requests"
    );
    assert_eq!(
        mock_state.conditional_seen.load(Ordering::SeqCst),
        1,
        "second request must carry the stored validator"
    );
}

#[tokio::test]
async fn test_playlist_content_hash_short_circuit_without_validators() {
    // An origin that never sends ETag or Last-Modified: the rolling hash
    // still detects the unchanged body
    async fn playlist() -> impl IntoResponse {
        "#EXTM3U\n#EXTINF:-1 tvg-id=\"A.uk\",Alpha\nhttp://192.0.2.9/live/u/p/7.ts\n"
    }
    let router = Router::new().route("/playlist.m3u", get(playlist));
    let upstream = start_mock_server(router).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.playlist_url = Some(format!("http://{}/playlist.m3u", upstream));
    // The dead stream URL makes the CF sample probe time out; keep it short
    config.probe_timeout_ms = 300;

    let fetcher = CatalogFetcher::new(
        Arc::new(config),
        HttpPool::new("tunerforge-test").unwrap(),
    );

    let first = fetcher.fetch().await.unwrap();
    assert!(first.snapshot.is_some());

    let second = fetcher.fetch().await.unwrap();
    assert!(second.not_modified, "matching content hash must short-circuit");
    assert!(second.snapshot.is_none());
}
