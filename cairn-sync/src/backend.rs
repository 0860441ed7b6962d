//! Storage surface the sync client talks to.
//!
//! The HTTP implementation lives in [`crate::http_backend`]; tests plug in
//! in-memory stubs.

use crate::error::{SyncError, SyncResult};
use crate::types::{CollectionIndex, RemoteRecord};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Remote storage capabilities consumed by the consistency core.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Collection name → last-modified timestamp. Empty for a new account.
    async fn info_collections(&self) -> SyncResult<CollectionIndex>;

    /// Fetches one record. `Ok(None)` when the record does not exist.
    async fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>>;

    /// Creates or replaces one record, returning the new modified timestamp.
    async fn put_record(&self, collection: &str, record: RemoteRecord) -> SyncResult<f64>;

    /// Removes every collection and record of the account.
    async fn delete_all(&self) -> SyncResult<()>;
}

/// Runs a remote call under `limit`, turning expiry into [`SyncError::Timeout`].
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation,
            after: limit,
        }),
    }
}
