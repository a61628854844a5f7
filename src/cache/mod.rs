//! TTL caches with atomic on-disk persistence
//!
//! Guide XML, smoketest verdicts, and probe results are all cached the same
//! way: a JSON envelope of `{value, fetched_at, ttl_secs}` written via
//! temp-file + rename so a crash mid-write never leaves a torn file. Each
//! cache file is guarded by its own async mutex.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Write a file atomically: create a sibling temp file, then rename over
/// the destination. Creates parent directories as needed.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let tmp = path.with_extension(format!(
        "tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, contents).await?;

    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// A cached value with its fetch time and lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl_secs: u64) -> Self {
        Self {
            value,
            fetched_at: Utc::now(),
            ttl_secs,
        }
    }

    /// True while the entry is within its TTL
    pub fn is_fresh(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl_secs
    }
}

/// A single-value disk cache
///
/// Corrupt or stale content reads as a miss; the next store overwrites it.
#[derive(Debug)]
pub struct DiskCache<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> DiskCache<T> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the entry if present and within its TTL
    pub async fn load_fresh(&self) -> Option<CacheEntry<T>> {
        let _guard = self.lock.lock().await;
        let raw = tokio::fs::read(&self.path).await.ok()?;
        let entry: CacheEntry<T> = serde_json::from_slice(&raw).ok()?;
        entry.is_fresh().then_some(entry)
    }

    /// Persist a new value with the given TTL
    pub async fn store(&self, value: T, ttl_secs: u64) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let entry = CacheEntry::new(value, ttl_secs);
        let encoded = serde_json::to_vec_pretty(&entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.path, &encoded).await
    }
}
