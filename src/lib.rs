pub mod cache;
pub mod catalog;
pub mod cloudflare;
pub mod config;
pub mod httpx;
pub mod netutil;
pub mod playlist;
pub mod provider;
pub mod refresh;
pub mod server;
pub mod smoketest;
pub mod supervisor;
pub mod xmltv;
pub mod xtream;

use std::sync::Arc;

use anyhow::Context;

use catalog::{store, CatalogFetcher, CatalogSnapshot};
use config::Config;
use httpx::HttpPool;
use server::AppState;

/// Run one tuner instance: fetch the catalog, expose the HTTP surface,
/// keep refreshing in the background until a termination signal arrives.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let pool = HttpPool::new(&config.user_agent).context("building HTTP transport")?;
    let fetcher = CatalogFetcher::new(config.clone(), pool.clone());

    let snapshot = startup_catalog(&config, &fetcher).await?;
    tracing::info!(channels = snapshot.len(), "catalog ready");

    let state = AppState::new(config.clone(), snapshot, pool);

    // Background refresh: interval + SIGHUP
    tokio::spawn(refresh::run_refresh_loop(state.clone(), fetcher));

    tokio::select! {
        result = server::start_server(state) => {
            result.context("HTTP server failed")?;
        }
        _ = wait_for_termination() => {
            tracing::info!("termination signal received, shutting down");
        }
    }
    Ok(())
}

/// One-shot catalog fetch, for `tunerforge fetch`
pub async fn fetch_once(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let pool = HttpPool::new(&config.user_agent).context("building HTTP transport")?;
    let fetcher = CatalogFetcher::new(config.clone(), pool);

    let outcome = fetcher.fetch().await.context("catalog fetch failed")?;
    if outcome.not_modified {
        tracing::info!("catalog unchanged");
    } else if let Some(snapshot) = outcome.snapshot {
        tracing::info!(channels = snapshot.len(), "catalog fetched");
    }
    Ok(())
}

/// The catalog the server starts with
///
/// A fresh fetch wins; on an unchanged fetch or a fetch failure the
/// persisted catalog is used. Starting with neither is fatal.
async fn startup_catalog(
    config: &Config,
    fetcher: &CatalogFetcher,
) -> anyhow::Result<Arc<CatalogSnapshot>> {
    match fetcher.fetch().await {
        Ok(outcome) => {
            if let Some(snapshot) = outcome.snapshot {
                return Ok(snapshot);
            }
            // Content hash matched: the persisted catalog is current
            let persisted = store::load(&config.catalog_path())
                .await
                .context("loading persisted catalog")?
                .context("fetch reported unchanged but no catalog exists")?;
            Ok(Arc::new(persisted))
        }
        Err(e) => {
            tracing::error!(error = %e, "startup catalog fetch failed");
            let persisted = store::load(&config.catalog_path())
                .await
                .context("loading persisted catalog")?
                .context("no catalog available: startup fetch failed and none persisted")?;
            tracing::warn!(
                channels = persisted.len(),
                "serving the previously persisted catalog"
            );
            Ok(Arc::new(persisted))
        }
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
