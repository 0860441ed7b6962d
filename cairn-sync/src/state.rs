//! Local bookkeeping that survives between cycles.
//!
//! Only non-secret facts are kept here. Decrypted keys belong to the
//! [`CollectionKeyManager`](crate::key_manager::CollectionKeyManager) and are
//! never written to disk.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSyncState {
    /// Sync identifier of the last cycle that completed.
    pub last_sync_id: Option<String>,
    /// Fingerprint of the last collection index that evaluated consistent.
    pub index_fingerprint: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl LocalSyncState {
    /// Forgets everything; the next cycle treats all local data as new.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Optional JSON file backing for [`LocalSyncState`].
#[derive(Clone, Debug, Default)]
pub struct LocalStateStore {
    path: Option<PathBuf>,
}

impl LocalStateStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Loads persisted state. A missing file is an empty state; an unreadable
    /// one is discarded so the next cycle rebuilds it from the server.
    pub async fn load(&self) -> SyncResult<LocalSyncState> {
        let Some(path) = &self.path else {
            return Ok(LocalSyncState::default());
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no local sync state at {}", path.display());
                return Ok(LocalSyncState::default());
            }
            Err(e) => {
                return Err(SyncError::LocalState(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("discarding unreadable local sync state at {}: {e}", path.display());
                Ok(LocalSyncState::default())
            }
        }
    }

    /// Writes state via a temporary file and rename.
    pub async fn save(&self, state: &LocalSyncState) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            SyncError::LocalState(format!("failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            SyncError::LocalState(format!("failed to replace {}: {e}", path.display()))
        })?;
        Ok(())
    }
}
