//! HTTP request handlers
//!
//! The discovery/lineup/guide endpoints serve generated documents with
//! ETags so the media server's frequent polling stays cheap. The stream
//! endpoint ties the whole gateway together: slot acquisition, upstream
//! failover, the startup gate, and teardown on disconnect.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

use super::gateway;
use super::hdhr;
use super::m3u;
use super::state::AppState;
use super::tuner;
use crate::xmltv::remap;

/// Health check response structure
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Health check endpoint handler
///
/// Used by the supervisor and monitoring tools to verify the instance is up.
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
        }),
    )
}

/// Fallback handler for 404 responses
pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// HDHomeRun discovery endpoint handler
pub async fn discover_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(hdhr::discover_response(state.config()))
}

/// HDHomeRun lineup endpoint handler
///
/// The lineup is truncated to `lineup_max_channels` and consistent with
/// `live.m3u` and `guide.xml`.
pub async fn lineup_json(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.catalog();
    Json(hdhr::lineup(state.config(), &catalog))
}

/// HDHomeRun lineup status endpoint handler
pub async fn lineup_status_json() -> impl IntoResponse {
    Json(hdhr::lineup_status())
}

/// M3U playlist endpoint handler
///
/// Returns Content-Type audio/x-mpegurl with an ETag for cache validation.
pub async fn playlist_m3u(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let catalog = state.catalog();
    let content = m3u::generate_playlist(state.config(), &catalog);
    Ok(cached_document(content, "audio/x-mpegurl", &headers))
}

/// XMLTV guide endpoint handler
///
/// Fetches the external guide (TTL-cached on disk), remaps source channel
/// ids to the lineup's guide numbers, and serves the result with an ETag.
pub async fn guide_xml(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let catalog = state.catalog();

    let raw = state.guide().raw_guide().await.map_err(|e| {
        tracing::error!(error = %e, "guide fetch failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "guide unavailable".to_string(),
        )
    })?;

    let map = catalog.tvg_to_guide_number();
    let remapped = remap::remap_guide(&raw, &map, state.config().epg_prune_unlinked)
        .map_err(|e| {
            tracing::error!(error = %e, "guide remap failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "guide unavailable".to_string(),
            )
        })?;

    Ok(cached_document(
        remapped,
        "application/xml; charset=utf-8",
        &headers,
    ))
}

/// Stream proxy endpoint handler
///
/// - 404 when the channel is not in the catalog
/// - 503 with HDHomeRun-style text when every tuner slot is taken
/// - 502 when every ranked upstream candidate is rejected
/// - 200 with a `video/mp2t` body otherwise; the startup gate runs inside
///   the body stream, so keepalive packets are the first bytes on the wire
pub async fn stream_proxy(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response<Body>, (StatusCode, String)> {
    let catalog = state.catalog();
    let Some(channel) = catalog.get(&channel_id) else {
        return Err((StatusCode::NOT_FOUND, "channel not found".to_string()));
    };

    // Slot first: rejecting over-capacity clients must not open upstreams
    let client_key = tuner::client_key(&headers, Some(peer.ip()));
    let slot = state
        .tuners()
        .acquire(&channel_id, &client_key)
        .map_err(|e| {
            tracing::warn!(
                channel_id,
                active = state.tuners().active_count(),
                capacity = state.tuners().capacity(),
                "rejecting stream request: {}",
                e
            );
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })?;

    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        session_id,
        channel_id,
        channel = %channel.guide_name,
        slot = slot.index(),
        "stream session opening"
    );

    // The channel's URLs are captured here; a catalog swap mid-session
    // does not affect this stream
    let upstream = gateway::open_upstream(state.http_pool(), channel, state.config(), &session_id)
        .await
        .map_err(|e| {
            tracing::warn!(session_id, channel_id, "all upstreams failed");
            // Slot released by drop
            (StatusCode::BAD_GATEWAY, e.to_string())
        })?;

    let rx = gateway::run_session(upstream, slot, state.config(), session_id);
    let body = Body::from_stream(ReceiverStream::new(rx));

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    Ok(response)
}

/// Serve a generated document with ETag validation and a short cache TTL
///
/// The media server polls these endpoints often; a 304 spares it the body.
fn cached_document(
    content: String,
    content_type: &'static str,
    request_headers: &HeaderMap,
) -> Response<Body> {
    let etag = format!("\"{}\"", generate_etag(&content));

    let not_modified = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == etag)
        .unwrap_or(false);

    let mut response = if not_modified {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
    } else {
        let mut response = Response::new(Body::from(content));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        response
    };

    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    response
}

/// Generate an ETag from a content hash
///
/// A fast non-cryptographic hash is enough for cache validation.
fn generate_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_stable_and_content_sensitive() {
        assert_eq!(generate_etag("abc"), generate_etag("abc"));
        assert_ne!(generate_etag("abc"), generate_etag("abd"));
    }

    #[test]
    fn test_cached_document_sets_etag_and_type() {
        let response = cached_document("hello".to_string(), "text/plain", &HeaderMap::new());
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ETAG));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[test]
    fn test_cached_document_304_on_matching_etag() {
        let first = cached_document("hello".to_string(), "text/plain", &HeaderMap::new());
        let etag = first.headers().get(header::ETAG).unwrap().clone();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, etag);
        let second = cached_document("hello".to_string(), "text/plain", &headers);
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    }
}
