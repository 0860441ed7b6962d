//! Fresh start: destructive re-initialization of server metadata and keys.
//!
//! Steps run strictly in order and none is skipped:
//! 1. wipe every collection on the server
//! 2. generate a new sync identifier
//! 3. generate a new default key (no per-collection overrides)
//! 4. publish the key bundle sealed under the passphrase-derived key
//! 5. publish the global metadata record for the new epoch
//! 6. clear the key cache, local bookkeeping, and every synchronizer
//!
//! A failure before step 5 completes leaves the server without metadata or
//! keys, so the next evaluation asks for a fresh start again.

use crate::backend::{with_timeout, StorageBackend};
use crate::bundle::KeyBundle;
use crate::config::{CollectionConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::key_manager::CollectionKeyManager;
use crate::state::{LocalStateStore, LocalSyncState};
use crate::synchronizer::CollectionSynchronizer;
use crate::types::*;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cairn_crypto::DerivedKey;
use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// One step of the fresh-start sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Wipe,
    GenerateSyncId,
    GenerateKeys,
    PublishKeys,
    PublishMetadata,
    ResetLocal,
}

impl RecoveryStep {
    pub fn number(&self) -> u8 {
        match self {
            RecoveryStep::Wipe => 1,
            RecoveryStep::GenerateSyncId => 2,
            RecoveryStep::GenerateKeys => 3,
            RecoveryStep::PublishKeys => 4,
            RecoveryStep::PublishMetadata => 5,
            RecoveryStep::ResetLocal => 6,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RecoveryStep::Wipe => "wipe server",
            RecoveryStep::GenerateSyncId => "generate sync identifier",
            RecoveryStep::GenerateKeys => "generate keys",
            RecoveryStep::PublishKeys => "publish key bundle",
            RecoveryStep::PublishMetadata => "publish metadata",
            RecoveryStep::ResetLocal => "reset local state",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.label())
    }
}

/// New opaque sync identifier: 9 random bytes, URL-safe base64 (12 chars).
pub fn generate_sync_id() -> String {
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Local collaborators reset by step 6.
pub struct RecoveryContext<'a> {
    pub keys: &'a CollectionKeyManager,
    /// Passphrase-derived key, obtained before anything destructive happens.
    pub bundle_key: &'a DerivedKey,
    pub local: &'a RwLock<LocalSyncState>,
    pub store: &'a LocalStateStore,
    pub synchronizers: &'a [Arc<dyn CollectionSynchronizer>],
}

/// Executes the fresh-start sequence against the storage backend.
pub struct RecoveryCoordinator {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
    storage_version: u32,
    collections: Vec<CollectionConfig>,
}

impl RecoveryCoordinator {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &SyncConfig) -> Self {
        Self {
            backend,
            timeout: config.remote_timeout(),
            storage_version: config.storage_version,
            collections: config.collections.clone(),
        }
    }

    /// Runs all six steps and returns the metadata record now on the server.
    ///
    /// A wipe failure propagates unchanged. Anything failing after the wipe
    /// is a [`SyncError::PartialFailure`] naming the step; it is never
    /// retried here.
    pub async fn perform_fresh_start(
        &self,
        ctx: RecoveryContext<'_>,
    ) -> SyncResult<GlobalMetadataRecord> {
        info!("fresh start: wiping server storage");
        with_timeout(self.timeout, "server wipe", self.backend.delete_all())
            .await
            .inspect_err(|e| error!("fresh start step {}: {e}", RecoveryStep::Wipe))?;

        let sync_id = generate_sync_id();
        debug!("fresh start: new sync identifier {sync_id}");

        let bundle = KeyBundle::generate();
        debug!("fresh start: generated new default key");

        let sealed = bundle
            .seal(ctx.bundle_key)
            .map_err(|e| partial(RecoveryStep::PublishKeys, e))?;
        self.publish(CRYPTO_COLLECTION, KEYS_RECORD_ID, sealed, "key bundle publish")
            .await
            .map_err(|e| partial(RecoveryStep::PublishKeys, e))?;

        let meta = self.new_metadata(sync_id);
        let payload = serde_json::to_string(&meta)
            .map_err(|e| partial(RecoveryStep::PublishMetadata, e.into()))?;
        self.publish(META_COLLECTION, GLOBAL_RECORD_ID, payload, "metadata publish")
            .await
            .map_err(|e| partial(RecoveryStep::PublishMetadata, e))?;

        self.reset_local(&ctx).await?;

        info!("fresh start complete, sync epoch is now {}", meta.sync_id);
        Ok(meta)
    }

    fn new_metadata(&self, sync_id: String) -> GlobalMetadataRecord {
        GlobalMetadataRecord {
            sync_id,
            storage_version: self.storage_version,
            engines: self
                .collections
                .iter()
                .map(|c| {
                    (
                        c.name.clone(),
                        EngineMeta {
                            version: c.version,
                            sync_id: generate_sync_id(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn publish(
        &self,
        collection: &str,
        id: &str,
        payload: String,
        operation: &'static str,
    ) -> SyncResult<()> {
        let modified = with_timeout(
            self.timeout,
            operation,
            self.backend
                .put_record(collection, RemoteRecord::new(id, payload)),
        )
        .await?;
        debug!("published {collection}/{id} at {modified:.2}");
        Ok(())
    }

    async fn reset_local(&self, ctx: &RecoveryContext<'_>) -> SyncResult<()> {
        ctx.keys.invalidate().await;

        let mut failures = Vec::new();
        for synchronizer in ctx.synchronizers {
            if let Err(e) = synchronizer.reset_client().await {
                warn!("failed to reset {}: {e}", synchronizer.name());
                failures.push(format!("{}: {e}", synchronizer.name()));
            }
        }

        {
            let mut local = ctx.local.write().await;
            local.reset();
            if let Err(e) = ctx.store.save(&local).await {
                warn!("failed to persist reset sync state: {e}");
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::PartialFailure {
                step: RecoveryStep::ResetLocal,
                reason: failures.join("; "),
            })
        }
    }
}

fn partial(step: RecoveryStep, cause: SyncError) -> SyncError {
    error!("fresh start step {step}: {cause}");
    SyncError::PartialFailure {
        step,
        reason: cause.to_string(),
    }
}
