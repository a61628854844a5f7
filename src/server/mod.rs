pub mod gateway;
pub mod handlers;
pub mod hdhr;
pub mod m3u;
pub mod routes;
pub mod state;
pub mod tuner;

use std::net::SocketAddr;

pub use state::AppState;

/// Server error types for proper error handling
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server runtime error: {0}")]
    RuntimeError(String),
}

/// Start the HTTP server
///
/// Binds `bind_address:listen_port` from the config and serves until the
/// process shuts down. Peer addresses are threaded through so the stream
/// endpoint can key tuner slots on them.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config().bind_address,
        state.config().listen_port
    )
    .parse()
    .map_err(|e| ServerError::RuntimeError(format!("invalid bind address: {}", e)))?;

    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("HTTP server listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
