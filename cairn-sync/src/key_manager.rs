//! Cache of decrypted collection keys for the current sync epoch.
//!
//! Keys are loaded lazily from the key bundle on first use after an
//! invalidation and then served from memory for the rest of the cycle. The
//! cache is tied to a sync identifier and to the index timestamp of the
//! key-bundle collection: binding a different identifier or timestamp drops
//! whatever was cached, so a rotated or replaced bundle is always refetched.

use crate::bundle::KeyBundle;
use crate::config::AccountCredentials;
use crate::error::{SyncError, SyncResult};
use crate::remote_state::RemoteStateClient;
use cairn_crypto::{derive_key, CryptoError, DerivedKey, KdfParams, Salt};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

#[derive(Default)]
struct KeyCache {
    /// Sync identifier the cache is bound to.
    epoch: Option<String>,
    /// Index timestamp of the key-bundle collection when bound.
    keys_modified: Option<f64>,
    bundle: Option<KeyBundle>,
}

/// Thread-safe collection key cache.
#[derive(Clone)]
pub struct CollectionKeyManager {
    remote: Arc<RemoteStateClient>,
    account_id: Arc<str>,
    passphrase: Arc<Zeroizing<String>>,
    kdf: KdfParams,
    bundle_key: Arc<OnceCell<DerivedKey>>,
    cache: Arc<RwLock<KeyCache>>,
}

impl CollectionKeyManager {
    pub fn new(
        remote: Arc<RemoteStateClient>,
        credentials: &AccountCredentials,
        kdf: KdfParams,
    ) -> Self {
        Self {
            remote,
            account_id: Arc::from(credentials.account_id.as_str()),
            passphrase: Arc::new(Zeroizing::new(credentials.passphrase().to_string())),
            kdf,
            bundle_key: Arc::new(OnceCell::new()),
            cache: Arc::new(RwLock::new(KeyCache::default())),
        }
    }

    /// The passphrase-derived key that seals the key bundle.
    ///
    /// Derived once per manager on a blocking thread; it depends only on the
    /// passphrase and account, so invalidation does not touch it.
    pub async fn bundle_key(&self) -> SyncResult<DerivedKey> {
        let key = self
            .bundle_key
            .get_or_try_init(|| async {
                let passphrase = Arc::clone(&self.passphrase);
                let salt = Salt::for_account(&self.account_id);
                let params = self.kdf.clone();
                tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt, &params))
                    .await
                    .map_err(|e| {
                        SyncError::Crypto(CryptoError::KeyDerivation(format!(
                            "derivation task failed: {e}"
                        )))
                    })?
                    .map_err(SyncError::from)
            })
            .await?;
        Ok(key.clone())
    }

    /// Binds the cache to `sync_id` and the key-bundle collection's index
    /// timestamp. Returns true if a loaded bundle was dropped because either
    /// changed. `None` means the timestamp is unknown, as right after a fresh
    /// start; the next known timestamp then forces one refetch.
    pub async fn bind_epoch(&self, sync_id: &str, keys_modified: Option<f64>) -> bool {
        let mut cache = self.cache.write().await;
        let same_epoch = cache.epoch.as_deref() == Some(sync_id);
        if same_epoch && cache.keys_modified == keys_modified {
            return false;
        }

        let stale = cache.bundle.take().is_some();
        if stale && same_epoch {
            info!("key bundle modified on server, dropping cached collection keys");
        } else if stale {
            info!("sync epoch changed to {sync_id}, dropping cached collection keys");
        }
        cache.epoch = Some(sync_id.to_string());
        cache.keys_modified = keys_modified;
        stale
    }

    /// Makes sure the bundle for the bound epoch is loaded, fetching and
    /// decrypting it if needed.
    pub async fn refresh(&self) -> SyncResult<()> {
        let bundle_key = self.bundle_key().await?;

        let mut cache = self.cache.write().await;
        if cache.bundle.is_some() {
            return Ok(());
        }
        let Some(epoch) = cache.epoch.clone() else {
            return Err(SyncError::NotAvailable(
                "key cache is not bound to a sync epoch".to_string(),
            ));
        };

        let bundle = self.remote.fetch_key_bundle(&bundle_key).await?;
        debug!("loaded key bundle for epoch {epoch}");
        cache.bundle = Some(bundle);
        Ok(())
    }

    /// Key for `collection`, falling back to the bundle's default key.
    pub async fn get_key_for(&self, collection: &str) -> SyncResult<DerivedKey> {
        {
            let cache = self.cache.read().await;
            if let Some(bundle) = &cache.bundle {
                return Ok(bundle.key_for(collection).clone());
            }
        }

        self.refresh().await?;

        self.cache
            .read()
            .await
            .bundle
            .as_ref()
            .map(|bundle| bundle.key_for(collection).clone())
            .ok_or_else(|| SyncError::NotAvailable(collection.to_string()))
    }

    /// Drops every cached key and the epoch binding.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        cache.epoch = None;
        cache.keys_modified = None;
        cache.bundle = None;
        debug!("collection key cache invalidated");
    }

    pub async fn is_loaded(&self) -> bool {
        self.cache.read().await.bundle.is_some()
    }

    pub async fn epoch(&self) -> Option<String> {
        self.cache.read().await.epoch.clone()
    }
}
