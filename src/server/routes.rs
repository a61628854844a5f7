use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{
    discover_json, fallback_handler, guide_xml, health_check, lineup_json, lineup_status_json,
    playlist_m3u, stream_proxy,
};
use super::state::AppState;

/// Create the Axum router with all routes configured
///
/// # Arguments
/// * `state` - Application state to attach to the router
///
/// # Returns
/// * `Router` - Configured Axum router ready for serving
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/live.m3u", get(playlist_m3u))
        .route("/guide.xml", get(guide_xml))
        // HDHomeRun emulation endpoints
        .route("/discover.json", get(discover_json))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        .route("/stream/{channel_id}", get(stream_proxy))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
