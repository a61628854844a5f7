//! Shared helpers for integration tests
//!
//! Tests run the real router against real sockets: mock upstreams are
//! plain axum servers on ephemeral ports, and the tuner app itself is
//! served the same way the binary serves it.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use tunerforge_lib::catalog::{CatalogSnapshot, LiveChannel};
use tunerforge_lib::config::{Config, GateTimeoutPolicy};
use tunerforge_lib::httpx::HttpPool;
use tunerforge_lib::server::{routes::create_router, AppState};
use tunerforge_lib::xtream::QualityTier;

/// A config with test-friendly defaults and an isolated data dir
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::new(GateTimeoutPolicy::Stream);
    config.data_dir = Some(data_dir.to_path_buf());
    config.base_url = Some("http://127.0.0.1:5004".to_string());
    config.provider_user = "user".to_string();
    config.provider_pass = "pass".to_string();
    config
}

/// A live channel pointing at arbitrary stream URLs
pub fn channel(id: &str, name: &str, guide_number: &str, urls: &[String]) -> LiveChannel {
    LiveChannel {
        channel_id: id.to_string(),
        guide_number: guide_number.to_string(),
        guide_name: name.to_string(),
        stream_url: urls[0].clone(),
        stream_urls: urls.to_vec(),
        tvg_id: String::new(),
        quality_tier: QualityTier::Sd,
        group_title: None,
        source_tag: None,
        category_id: None,
    }
}

/// Serve any router on an ephemeral port
pub async fn start_mock_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().expect("Failed to get local address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Mock server error");
    });
    addr
}

/// Start the tuner app with the given config and catalog
pub async fn start_app(config: Config, catalog: CatalogSnapshot) -> SocketAddr {
    let state = AppState::new(
        Arc::new(config),
        Arc::new(catalog),
        HttpPool::new("tunerforge-test").expect("Failed to build pool"),
    );
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind app server");
    let addr = listener.local_addr().expect("Failed to get local address");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("App server error");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    addr
}
