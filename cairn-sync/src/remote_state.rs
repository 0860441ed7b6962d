//! Read-only access to the account's bookkeeping records.

use crate::backend::{with_timeout, StorageBackend};
use crate::bundle::KeyBundle;
use crate::error::{SyncError, SyncResult};
use crate::types::*;
use cairn_crypto::DerivedKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fetches the collection index, global metadata, and key bundle.
///
/// Never writes to the server.
pub struct RemoteStateClient {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl RemoteStateClient {
    pub fn new(backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn fetch_collection_index(&self) -> SyncResult<CollectionIndex> {
        let index = with_timeout(
            self.timeout,
            "collection index fetch",
            self.backend.info_collections(),
        )
        .await?;
        debug!(
            "collection index lists {} collections: {}",
            index.len(),
            index.names().collect::<Vec<_>>().join(", ")
        );
        Ok(index)
    }

    /// Fails with [`SyncError::NotFound`] when the record is absent and
    /// [`SyncError::Malformed`] when its payload cannot be decoded.
    pub async fn fetch_global_metadata(&self) -> SyncResult<GlobalMetadataRecord> {
        let record = self
            .fetch_record(META_COLLECTION, GLOBAL_RECORD_ID, "global metadata fetch")
            .await?;

        serde_json::from_str(&record.payload)
            .map_err(|e| SyncError::Malformed(format!("{META_COLLECTION}/{GLOBAL_RECORD_ID}: {e}")))
    }

    /// Fetches and opens the key bundle with the passphrase-derived key.
    pub async fn fetch_key_bundle(&self, bundle_key: &DerivedKey) -> SyncResult<KeyBundle> {
        let record = self
            .fetch_record(CRYPTO_COLLECTION, KEYS_RECORD_ID, "key bundle fetch")
            .await?;
        KeyBundle::open(&record.payload, bundle_key)
    }

    async fn fetch_record(
        &self,
        collection: &str,
        id: &str,
        operation: &'static str,
    ) -> SyncResult<RemoteRecord> {
        with_timeout(self.timeout, operation, self.backend.get_record(collection, id))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{collection}/{id}")))
    }
}
