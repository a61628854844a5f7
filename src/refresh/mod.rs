//! Periodic catalog refresh
//!
//! One background task per process: ticks on `refresh_interval`, also wakes
//! on SIGHUP. A successful fetch is persisted by the fetcher before the
//! channel table is swapped; a failed fetch logs and leaves the running
//! catalog untouched. `update_channels` is never called with the result of
//! a failed or unchanged fetch.

use std::time::Duration;

use crate::catalog::CatalogFetcher;
use crate::server::AppState;

/// Run the refresh loop until the process exits
pub async fn run_refresh_loop(state: AppState, fetcher: CatalogFetcher) {
    let period = Duration::from_secs(state.config().refresh_interval_secs.max(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The startup fetch already ran; skip the immediate first tick
    interval.tick().await;

    #[cfg(unix)]
    let mut sighup =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();

    loop {
        #[cfg(unix)]
        {
            let hangup = async {
                match sighup.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = interval.tick() => {
                    tracing::info!("scheduled catalog refresh");
                }
                _ = hangup => {
                    tracing::info!("SIGHUP received, refreshing catalog");
                }
            }
        }
        #[cfg(not(unix))]
        {
            interval.tick().await;
            tracing::info!("scheduled catalog refresh");
        }

        refresh_once(&state, &fetcher).await;
    }
}

/// One refresh pass: fetch, then swap only on success with changes
pub async fn refresh_once(state: &AppState, fetcher: &CatalogFetcher) {
    match fetcher.fetch().await {
        Ok(outcome) => {
            if let Some(snapshot) = outcome.snapshot {
                state.update_channels(snapshot);
            } else if outcome.not_modified {
                tracing::info!("catalog unchanged, no swap");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "catalog refresh failed, keeping current catalog");
        }
    }
}
