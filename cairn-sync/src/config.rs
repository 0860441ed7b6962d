//! Sync session configuration.

use crate::error::{SyncError, SyncResult};
use crate::types::{CRYPTO_COLLECTION, META_COLLECTION, STORAGE_VERSION};
use cairn_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

/// Data collections known to this client. Anything else on the server is
/// left alone.
const DEFAULT_COLLECTIONS: &[&str] = &[
    "clients",
    "bookmarks",
    "forms",
    "history",
    "passwords",
    "prefs",
    "tabs",
];

/// A data collection and the engine version this client writes for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub version: u32,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
        }
    }
}

/// Configuration for a [`SyncSession`](crate::SyncSession).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Explicit set of data collections. Published as engines on fresh start.
    pub collections: Vec<CollectionConfig>,

    /// Storage-format version this client reads and writes.
    pub storage_version: u32,

    /// Timeout applied to every remote call (milliseconds).
    pub remote_timeout_ms: u64,

    /// Argon2id parameters for the passphrase-derived bundle key.
    pub kdf: KdfParams,

    /// Where non-secret bookkeeping is persisted. `None` keeps it in memory.
    pub state_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collections: DEFAULT_COLLECTIONS
                .iter()
                .map(|name| CollectionConfig::new(*name))
                .collect(),
            storage_version: STORAGE_VERSION,
            remote_timeout_ms: 30_000,
            kdf: KdfParams::default(),
            state_path: None,
        }
    }
}

impl SyncConfig {
    /// Default config restricted to the given collections.
    pub fn with_collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: names.into_iter().map(CollectionConfig::new).collect(),
            ..Self::default()
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(|c| c.name.as_str())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.collections.is_empty() {
            return Err(SyncError::Config("no collections configured".to_string()));
        }
        if self.remote_timeout_ms == 0 {
            return Err(SyncError::Config("remote_timeout_ms must be positive".to_string()));
        }
        if self.storage_version == 0 {
            return Err(SyncError::Config("storage_version must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            let name = collection.name.as_str();
            if name.is_empty() {
                return Err(SyncError::Config("empty collection name".to_string()));
            }
            if name == META_COLLECTION || name == CRYPTO_COLLECTION {
                return Err(SyncError::Config(format!(
                    "collection name {name} is reserved"
                )));
            }
            if !seen.insert(name) {
                return Err(SyncError::Config(format!("duplicate collection {name}")));
            }
        }
        Ok(())
    }
}

/// What the authentication layer hands to a session.
#[derive(Clone)]
pub struct AccountCredentials {
    pub account_id: String,
    /// Transport credential (HTTP basic auth password).
    pub credential: String,
    passphrase: Zeroizing<String>,
}

impl AccountCredentials {
    pub fn new(
        account_id: impl Into<String>,
        credential: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            credential: credential.into(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Passphrase the key-bundle key is derived from.
    pub fn passphrase(&self) -> &str {
        self.passphrase.as_str()
    }
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("account_id", &self.account_id)
            .field("credential", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}
