//! Catalog persistence
//!
//! Snapshots are written with temp-file + rename so a crash never leaves a
//! torn catalog, and the previous catalog survives any failed run.

use std::path::Path;

use super::model::{CatalogError, CatalogSnapshot};
use crate::cache::write_atomic;

/// Persist a snapshot atomically
pub async fn save(snapshot: &CatalogSnapshot, path: &Path) -> Result<(), CatalogError> {
    let encoded = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &encoded).await?;
    tracing::info!(
        path = %path.display(),
        channels = snapshot.len(),
        "catalog persisted"
    );
    Ok(())
}

/// Load and re-validate a persisted snapshot
///
/// Returns `Ok(None)` when no catalog exists yet.
pub async fn load(path: &Path) -> Result<Option<CatalogSnapshot>, CatalogError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CatalogError::Persist(e)),
    };

    let mut snapshot: CatalogSnapshot = serde_json::from_slice(&raw)?;
    snapshot.validate_and_index()?;
    Ok(Some(snapshot))
}
