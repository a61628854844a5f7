//! XMLTV guide pipeline
//!
//! Fetches the external guide (with a TTL disk cache), remaps source
//! channel ids to the lineup's guide numbers, and drops everything the
//! lineup doesn't carry.

pub mod fetcher;
pub mod remap;

pub use fetcher::GuideCache;

/// Error types for XMLTV operations
#[derive(Debug, thiserror::Error)]
pub enum XmltvError {
    #[error("No XMLTV source configured")]
    NoSource,

    #[error("Download failed: {0}")]
    DownloadError(String),

    #[error("Decompression failed: {0}")]
    DecompressError(String),

    #[error("XML parse error: {0}")]
    ParseError(String),
}
