//! Shared fixtures: stub storage backends and a recording synchronizer.
#![allow(dead_code)]

use async_trait::async_trait;
use cairn_crypto::{DerivedKey, KdfParams};
use cairn_sync::{
    AccountCredentials, CancelHandle, CollectionIndex, CollectionSynchronizer, RemoteRecord,
    StorageBackend, SyncConfig, SyncError, SyncResult, SyncSession,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const ACCOUNT: &str = "johndoe";
pub const CREDENTIAL: &str = "ilovejane";
pub const PASSPHRASE: &str = "a-aaaaa-aaaaa-aaaaa-aaaaa-aaaaa";

pub fn credentials() -> AccountCredentials {
    AccountCredentials::new(ACCOUNT, CREDENTIAL, PASSPHRASE)
}

pub fn credentials_with_passphrase(passphrase: &str) -> AccountCredentials {
    AccountCredentials::new(ACCOUNT, CREDENTIAL, passphrase)
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        kdf: KdfParams::fast(),
        remote_timeout_ms: 5_000,
        ..SyncConfig::default()
    }
}

pub async fn open_session(backend: Arc<dyn StorageBackend>) -> SyncSession {
    SyncSession::open(credentials(), backend, test_config())
        .await
        .expect("session must open")
}

/// Installs a test subscriber once; output shows with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Empty-account stub ──────────────────────────────────────────

/// A server that always looks like a brand-new account: the index is
/// empty, records are never found, and writes are accepted but dropped.
#[derive(Default)]
pub struct EmptyAccountBackend {
    pub wipes: AtomicUsize,
    pub puts: AtomicUsize,
}

#[async_trait]
impl StorageBackend for EmptyAccountBackend {
    async fn info_collections(&self) -> SyncResult<CollectionIndex> {
        Ok(CollectionIndex::new())
    }

    async fn get_record(&self, _collection: &str, _id: &str) -> SyncResult<Option<RemoteRecord>> {
        Ok(None)
    }

    async fn put_record(&self, _collection: &str, _record: RemoteRecord) -> SyncResult<f64> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(0.0)
    }

    async fn delete_all(&self) -> SyncResult<()> {
        self.wipes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Stateful stub ───────────────────────────────────────────────

/// Remote operations that can be made to fail.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Info,
    Get(String),
    Put(String),
    Wipe,
}

#[derive(Default)]
struct ServerState {
    records: BTreeMap<String, BTreeMap<String, RemoteRecord>>,
    index: CollectionIndex,
    clock: f64,
}

/// In-memory server that tracks the collection index as records are
/// written, with fault injection for every operation.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<ServerState>,
    faults: Mutex<HashSet<Op>>,
    respond_empty: AtomicBool,
    info_delay: Mutex<Option<Duration>>,
    info_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    cancel_on_wipe: Mutex<Option<CancelHandle>>,
    cancel_on_info: Mutex<Option<CancelHandle>>,
    log: Mutex<Vec<String>>,
    pub wipes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, op: Op) {
        self.faults.lock().unwrap().insert(op);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Makes the index endpoint answer `{}` regardless of contents.
    pub fn set_respond_empty(&self, empty: bool) {
        self.respond_empty.store(empty, Ordering::SeqCst);
    }

    pub fn delay_info(&self, delay: Duration) {
        *self.info_delay.lock().unwrap() = Some(delay);
    }

    /// Holds the next index fetch until `release` is notified. `entered`
    /// is notified when a fetch reaches the gate.
    pub fn gate_info(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.info_gate.lock().unwrap() = Some((Arc::clone(&entered), Arc::clone(&release)));
        (entered, release)
    }

    /// Cancels `handle` while the next wipe is in progress.
    pub fn cancel_during_wipe(&self, handle: CancelHandle) {
        *self.cancel_on_wipe.lock().unwrap() = Some(handle);
    }

    /// Cancels `handle` while the next index fetch is in progress.
    pub fn cancel_during_info(&self, handle: CancelHandle) {
        *self.cancel_on_info.lock().unwrap() = Some(handle);
    }

    /// Drops an index entry while leaving its records in place.
    pub fn remove_index_entry(&self, collection: &str) {
        self.state.lock().unwrap().index.remove(collection);
    }

    pub fn put_raw(&self, collection: &str, id: &str, payload: &str) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1.0;
        let modified = state.clock;
        let record = RemoteRecord {
            id: id.to_string(),
            modified,
            payload: payload.to_string(),
        };
        state
            .records
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        state.index.insert(collection, modified);
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub fn index(&self) -> CollectionIndex {
        self.state.lock().unwrap().index.clone()
    }

    pub fn wipe_count(&self) -> usize {
        self.wipes.load(Ordering::SeqCst)
    }

    /// Operations seen so far, e.g. `"put crypto/keys"`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn check(&self, op: Op) -> SyncResult<()> {
        if self.faults.lock().unwrap().contains(&op) {
            return Err(SyncError::Unreachable(format!("injected failure for {op:?}")));
        }
        Ok(())
    }

    fn note(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn info_collections(&self) -> SyncResult<CollectionIndex> {
        self.note("info".to_string());

        let gate = self.info_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let delay = *self.info_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let cancel = self.cancel_on_info.lock().unwrap().take();
        if let Some(handle) = cancel {
            handle.cancel();
        }

        self.check(Op::Info)?;
        if self.respond_empty.load(Ordering::SeqCst) {
            return Ok(CollectionIndex::new());
        }
        Ok(self.index())
    }

    async fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>> {
        self.note(format!("get {collection}/{id}"));
        self.check(Op::Get(collection.to_string()))?;
        Ok(self.record(collection, id))
    }

    async fn put_record(&self, collection: &str, record: RemoteRecord) -> SyncResult<f64> {
        self.note(format!("put {collection}/{}", record.id));
        self.check(Op::Put(collection.to_string()))?;
        self.put_raw(collection, &record.id, &record.payload);
        Ok(self.state.lock().unwrap().clock)
    }

    async fn delete_all(&self) -> SyncResult<()> {
        self.note("wipe".to_string());
        let cancel = self.cancel_on_wipe.lock().unwrap().take();
        if let Some(handle) = cancel {
            handle.cancel();
        }
        self.check(Op::Wipe)?;
        let mut state = self.state.lock().unwrap();
        state.records.clear();
        state.index = CollectionIndex::new();
        self.wipes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Recording synchronizer ─────────────────────────────────────

/// Downstream synchronizer that records what the session asked of it.
pub struct RecordingSynchronizer {
    name: String,
    pub resets: AtomicUsize,
    pub syncs: AtomicUsize,
    last_key: Mutex<Option<[u8; 32]>>,
    fail_sync: AtomicBool,
    fail_reset: AtomicBool,
}

impl RecordingSynchronizer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            resets: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            last_key: Mutex::new(None),
            fail_sync: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
        })
    }

    pub fn fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn last_key(&self) -> Option<[u8; 32]> {
        *self.last_key.lock().unwrap()
    }
}

#[async_trait]
impl CollectionSynchronizer for RecordingSynchronizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reset_client(&self) -> SyncResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(SyncError::LocalState(format!("{} reset refused", self.name)));
        }
        Ok(())
    }

    async fn sync(&self, key: &DerivedKey) -> SyncResult<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        *self.last_key.lock().unwrap() = Some(*key.as_bytes());
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable(format!("{} upload failed", self.name)));
        }
        Ok(())
    }
}
