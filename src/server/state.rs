//! Shared server state
//!
//! The catalog hangs behind a single `RwLock<Arc<_>>`: readers clone the
//! Arc once per request and work on an immutable snapshot, the refresh
//! loop swaps the pointer after a successful persist. A request in flight
//! keeps whatever snapshot it started with.

use std::sync::{Arc, RwLock};

use crate::catalog::CatalogSnapshot;
use crate::config::Config;
use crate::httpx::HttpPool;
use crate::server::tuner::TunerPool;
use crate::xmltv::GuideCache;

/// Application state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    catalog: Arc<RwLock<Arc<CatalogSnapshot>>>,
    tuners: Arc<TunerPool>,
    pool: HttpPool,
    guide: Arc<GuideCache>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<CatalogSnapshot>,
        pool: HttpPool,
    ) -> Self {
        let tuners = TunerPool::new(config.tuner_count as usize);
        let guide = Arc::new(GuideCache::new(
            pool.clone(),
            config.xmltv_url.clone(),
            config.xmltv_cache_path(),
            config.xmltv_cache_ttl_secs,
        ));
        Self {
            config,
            catalog: Arc::new(RwLock::new(catalog)),
            tuners,
            pool,
            guide,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current snapshot; each request reads the pointer once
    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.read().expect("catalog lock poisoned").clone()
    }

    /// Install a new snapshot
    ///
    /// Called only after the catalog was fully persisted. Readers see the
    /// old or the new snapshot in full, never a mix.
    pub fn update_channels(&self, snapshot: Arc<CatalogSnapshot>) {
        let mut current = self.catalog.write().expect("catalog lock poisoned");
        tracing::info!(
            old = current.len(),
            new = snapshot.len(),
            "channel table swapped"
        );
        *current = snapshot;
    }

    pub fn tuners(&self) -> &Arc<TunerPool> {
        &self.tuners
    }

    pub fn http_pool(&self) -> &HttpPool {
        &self.pool
    }

    pub fn guide(&self) -> &Arc<GuideCache> {
        &self.guide
    }
}
