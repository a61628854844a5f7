//! XMLTV fetching and caching
//!
//! The raw upstream guide is cached on disk with a TTL; remapping happens
//! on every request against the current catalog, so a catalog swap is
//! reflected immediately without refetching the guide.

use std::io::Read;
use std::path::PathBuf;

use flate2::read::GzDecoder;

use super::XmltvError;
use crate::cache::DiskCache;
use crate::httpx::HttpPool;
use crate::netutil;

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Detect gzip content from magic bytes
pub fn detect_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0..2] == GZIP_MAGIC
}

/// TTL-cached access to the external guide
pub struct GuideCache {
    pool: HttpPool,
    url: Option<String>,
    cache: DiskCache<String>,
    ttl_secs: u64,
}

impl GuideCache {
    pub fn new(pool: HttpPool, url: Option<String>, cache_path: PathBuf, ttl_secs: u64) -> Self {
        Self {
            pool,
            url,
            cache: DiskCache::new(cache_path),
            ttl_secs,
        }
    }

    /// The raw guide XML, from cache when fresh
    pub async fn raw_guide(&self) -> Result<String, XmltvError> {
        let url = self.url.as_ref().ok_or(XmltvError::NoSource)?;

        if let Some(entry) = self.cache.load_fresh().await {
            tracing::debug!("guide served from cache");
            return Ok(entry.value);
        }

        let xml = self.fetch(url).await?;
        if let Err(e) = self.cache.store(xml.clone(), self.ttl_secs).await {
            tracing::warn!(error = %e, "failed to persist guide cache");
        }
        Ok(xml)
    }

    /// Download and decompress the guide
    ///
    /// Handles plain XML and gzipped feeds, detected by magic bytes or
    /// content type.
    async fn fetch(&self, url: &str) -> Result<String, XmltvError> {
        netutil::validate_url(url).map_err(|e| XmltvError::DownloadError(e.to_string()))?;

        let response = self
            .pool
            .api_client()
            .get(url)
            .send()
            .await
            .map_err(|e| XmltvError::DownloadError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(XmltvError::DownloadError(format!(
                "HTTP {} from guide source",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let is_gzip_content_type =
            content_type.contains("gzip") || content_type.contains("application/x-gzip");

        let data = response
            .bytes()
            .await
            .map_err(|e| XmltvError::DownloadError(e.to_string()))?;

        let xml_bytes = if detect_gzip(&data) || is_gzip_content_type {
            decompress_gzip(&data)?
        } else {
            data.to_vec()
        };

        String::from_utf8(xml_bytes)
            .map_err(|e| XmltvError::ParseError(format!("guide is not UTF-8: {}", e)))
    }
}

/// Decompress gzip data
fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>, XmltvError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| XmltvError::DecompressError(e.to_string()))?;
    Ok(decompressed)
}
