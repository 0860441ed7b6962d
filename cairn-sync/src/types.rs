//! Shared types for remote bookkeeping records and sync cycles.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Collection holding the global metadata record.
pub const META_COLLECTION: &str = "meta";

/// Record id of the global metadata record inside [`META_COLLECTION`].
pub const GLOBAL_RECORD_ID: &str = "global";

/// Collection holding the key bundle.
pub const CRYPTO_COLLECTION: &str = "crypto";

/// Record id of the key bundle inside [`CRYPTO_COLLECTION`].
pub const KEYS_RECORD_ID: &str = "keys";

/// Storage-format version written by this client.
pub const STORAGE_VERSION: u32 = 5;

/// Last-modified timestamp of every collection on the server, in seconds.
///
/// An account with no data yet has an empty index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionIndex(BTreeMap<String, f64>);

impl CollectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.0.contains_key(collection)
    }

    pub fn modified(&self, collection: &str) -> Option<f64> {
        self.0.get(collection).copied()
    }

    pub fn insert(&mut self, collection: impl Into<String>, modified: f64) {
        self.0.insert(collection.into(), modified);
    }

    pub fn remove(&mut self, collection: &str) -> Option<f64> {
        self.0.remove(collection)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// SHA-256 over the sorted `name:timestamp` entries, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, modified) in &self.0 {
            hasher.update(format!("{name}:{modified:.2}\n").as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for CollectionIndex {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A single server record. `payload` is an opaque JSON string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default)]
    pub modified: f64,
    pub payload: String,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            modified: 0.0,
            payload: payload.into(),
        }
    }
}

/// Per-engine entry of the global metadata record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMeta {
    pub version: u32,
    #[serde(rename = "syncID")]
    pub sync_id: String,
}

/// Account-wide metadata: the sync epoch and storage format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadataRecord {
    #[serde(rename = "syncID")]
    pub sync_id: String,
    #[serde(rename = "storageVersion")]
    pub storage_version: u32,
    #[serde(default)]
    pub engines: BTreeMap<String, EngineMeta>,
}

/// States of one sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Start,
    FetchingState,
    Evaluating,
    FreshStart,
    KeyRefresh,
    Delegating,
    Done,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Start => "START",
            CycleState::FetchingState => "FETCHING_STATE",
            CycleState::Evaluating => "EVALUATING",
            CycleState::FreshStart => "FRESH_START",
            CycleState::KeyRefresh => "KEY_REFRESH",
            CycleState::Delegating => "DELEGATING",
            CycleState::Done => "DONE",
            CycleState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
