//! Durable fetch checkpoints
//!
//! The fetch state lives beside the catalog as
//! `catalog.json.fetchstate.json` and records, per provider category, the
//! HTTP validators and content hashes of the last successful fetch. A run
//! that crashes mid-way resumes from the completed categories. The state
//! never contains credentials; the provider is identified by a hash.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::write_atomic;

/// Per-category checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryState {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    /// Hash of the last fetched body; change detection for ETag-blind panels
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    /// False while a category fetch is outstanding or failed
    #[serde(default)]
    pub complete: bool,
    /// Per-channel content hashes for new/changed/unchanged diffing
    #[serde(default)]
    pub stream_hashes: HashMap<String, String>,
}

/// Durable state of the conditional-fetch pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchState {
    /// `hex(sha256(api_base || user))`; a mismatch discards the whole state
    pub provider_key: String,
    #[serde(default)]
    pub categories: HashMap<String, CategoryState>,
    /// Hash over all category hashes; short-circuits unchanged runs
    #[serde(default)]
    pub content_hash: Option<String>,
    /// The base URL the catalog was indexed against (no credentials)
    #[serde(default)]
    pub stream_base: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: u64,
}

impl FetchState {
    /// Identity of a provider account, safe to persist
    pub fn provider_key_for(api_base: &str, user: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_base.as_bytes());
        hasher.update(user.as_bytes());
        hex_digest(hasher)
    }

    /// Load prior state; discard it when the provider key differs
    pub async fn load(path: &Path, provider_key: &str) -> Self {
        let loaded: Option<FetchState> = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw).ok(),
            Err(_) => None,
        };

        match loaded {
            Some(state) if state.provider_key == provider_key => state,
            Some(_) => {
                tracing::info!("fetch state belongs to a different provider, discarding");
                Self::fresh(provider_key)
            }
            None => Self::fresh(provider_key),
        }
    }

    fn fresh(provider_key: &str) -> Self {
        Self {
            provider_key: provider_key.to_string(),
            ..Default::default()
        }
    }

    /// Persist atomically beside the catalog
    pub async fn persist(&self, path: &Path) -> io::Result<()> {
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(path, &encoded).await
    }

    /// Mutable access to a category checkpoint, created on first touch
    pub fn category_mut(&mut self, category_id: &str) -> &mut CategoryState {
        self.categories.entry(category_id.to_string()).or_default()
    }

    /// Combined hash over all complete categories, in key order
    pub fn combined_content_hash(&self) -> String {
        let mut keys: Vec<&String> = self.categories.keys().collect();
        keys.sort();

        let mut hasher = Sha256::new();
        for key in keys {
            let category = &self.categories[key];
            hasher.update(key.as_bytes());
            if let Some(hash) = &category.content_hash {
                hasher.update(hash.as_bytes());
            }
        }
        hex_digest(hasher)
    }
}

/// Hex sha256 of a byte slice
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
