//! Seam to the per-collection synchronizers that run once keys are trusted.

use crate::error::SyncResult;
use async_trait::async_trait;
use cairn_crypto::DerivedKey;
use serde::Serialize;

/// A data-type engine (bookmarks, history, ...) driven after consistency
/// has been established.
#[async_trait]
pub trait CollectionSynchronizer: Send + Sync {
    /// Collection this synchronizer owns.
    fn name(&self) -> &str;

    /// Forgets all sync bookkeeping so every local record is uploaded again.
    /// Called on fresh start and whenever the server's sync epoch changes.
    async fn reset_client(&self) -> SyncResult<()>;

    /// Synchronizes the collection with the key for the current epoch.
    async fn sync(&self, key: &DerivedKey) -> SyncResult<()>;
}

/// Per-collection result recorded in a cycle report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CollectionOutcome {
    Synced,
    Failed(String),
    /// No key could be obtained for the collection.
    Skipped(String),
}
