//! Cloudflare detection
//!
//! IPTV bases that serve through Cloudflare mis-report status codes, rate
//! limit aggressively, and drop connections mid-stream, so they are treated
//! as a first-class failure mode: the prober classifies them, the catalog
//! fetcher refuses to index them, and the retry policy knows their
//! non-standard status codes are not worth retrying.
//!
//! Detection is header-based, not status-based. A CF-fronted origin can
//! return any status it likes; the proxy headers are what give it away.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Response headers that only Cloudflare sets
const CF_HEADERS: [&str; 4] = ["cf-ray", "cf-cache-status", "cf-worker", "cf-request-id"];

/// Non-standard status code Cloudflare-fronted IPTV panels emit
pub const CF_STATUS_BLOCKED: u16 = 884;

/// Detect whether a response was served through Cloudflare
///
/// True when any CF-specific header is present or the `Server` header
/// names cloudflare, regardless of status code.
pub fn detect_cloudflare(status: StatusCode, headers: &HeaderMap) -> bool {
    let _ = status; // detection is header-based; status alone proves nothing

    for name in CF_HEADERS {
        if headers.contains_key(name) {
            return true;
        }
    }

    if let Some(server) = headers.get(reqwest::header::SERVER) {
        if let Ok(value) = server.to_str() {
            if value.to_ascii_lowercase().contains("cloudflare") {
                return true;
            }
        }
    }

    false
}

/// True for status codes outside the IANA-registered ranges
///
/// Cloudflare-fronted panels answer blocked requests with made-up codes
/// like 884. Those are never retryable.
pub fn is_nonstandard_status(status: StatusCode) -> bool {
    let code = status.as_u16();
    !(100..=599).contains(&code)
}
