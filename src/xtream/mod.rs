//! Xtream Codes API support
//!
//! Xtream panels expose `player_api.php` actions for categories and stream
//! lists plus a `get.php` playlist endpoint. Responses are JSON with very
//! loose typing (numbers arrive as strings at random), and the stream URLs
//! follow the `/live/{user}/{pass}/{id}.ts` convention.

pub mod client;
pub mod quality;
pub mod types;

pub use client::XtreamClient;
pub use quality::QualityTier;

/// Error types for Xtream API operations
#[derive(Debug, thiserror::Error)]
pub enum XtreamError {
    #[error("Invalid server URL")]
    InvalidUrl,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: status {0}")]
    HttpError(u16),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Response served through Cloudflare")]
    Cloudflare,

    #[error("Invalid response format")]
    InvalidResponse,

    #[error("Transport error: {0}")]
    Transport(#[from] crate::httpx::HttpError),
}
