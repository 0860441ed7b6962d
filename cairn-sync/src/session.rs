//! Per-account sync session: drives one consistency-checked cycle at a time.
//!
//! ```text
//! START → FETCHING_STATE → EVALUATING → (FRESH_START →) KEY_REFRESH → DELEGATING → DONE
//!                                      any state → FAILED
//! ```
//!
//! A session owns its remote client, key manager, and local bookkeeping.
//! Clones share the same state, and at most one cycle runs at a time; a
//! second trigger while one is in flight is rejected. Local bookkeeping is
//! only committed when a cycle reaches DONE.

use crate::backend::StorageBackend;
use crate::config::{AccountCredentials, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::evaluator::{self, Decision, FreshStartReason};
use crate::key_manager::CollectionKeyManager;
use crate::recovery::{RecoveryContext, RecoveryCoordinator};
use crate::remote_state::RemoteStateClient;
use crate::state::{LocalStateStore, LocalSyncState};
use crate::synchronizer::{CollectionOutcome, CollectionSynchronizer};
use crate::types::{CollectionIndex, CycleState, GlobalMetadataRecord, CRYPTO_COLLECTION};
use cairn_crypto::DerivedKey;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Requests cancellation of the in-flight cycle.
///
/// Honored only at state boundaries. A fresh start that has begun always
/// runs to completion first.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What happened during one completed cycle.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CycleReport {
    /// States entered, in order, starting with `Start`.
    pub states: Vec<CycleState>,
    /// Set when this cycle performed a fresh start.
    pub fresh_start: Option<FreshStartReason>,
    /// Set when the server's sync epoch differed from the last completed one.
    pub epoch_changed: bool,
    /// Sync identifier committed at the end of the cycle.
    pub sync_id: Option<String>,
    pub outcomes: BTreeMap<String, CollectionOutcome>,
}

impl CycleReport {
    pub fn performed_fresh_start(&self) -> bool {
        self.fresh_start.is_some()
    }

    fn state(&self) -> CycleState {
        self.states.last().copied().unwrap_or(CycleState::Start)
    }

    fn enter(&mut self, state: CycleState) {
        debug!("sync cycle: {} -> {state}", self.state());
        self.states.push(state);
    }
}

/// Remote view after EVALUATING.
enum Evaluated {
    Current(GlobalMetadataRecord),
    Diverged(FreshStartReason),
}

/// Sync session for one account.
#[derive(Clone)]
pub struct SyncSession {
    account_id: Arc<str>,
    config: Arc<SyncConfig>,
    remote: Arc<RemoteStateClient>,
    keys: CollectionKeyManager,
    recovery: Arc<RecoveryCoordinator>,
    store: Arc<LocalStateStore>,
    local: Arc<RwLock<LocalSyncState>>,
    synchronizers: Arc<RwLock<Vec<Arc<dyn CollectionSynchronizer>>>>,
    in_flight: Arc<Mutex<()>>,
    cancel: CancelHandle,
    fresh_starts: Arc<AtomicU64>,
}

impl SyncSession {
    /// Builds a session for `credentials` over `backend`, loading any
    /// persisted bookkeeping.
    ///
    /// Keep exactly one session per account and share it by cloning. The
    /// in-flight guard lives in the session, so two sessions opened for the
    /// same account can run cycles concurrently and race on the server.
    pub async fn open(
        credentials: AccountCredentials,
        backend: Arc<dyn StorageBackend>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;

        let store = LocalStateStore::new(config.state_path.clone());
        let local = store.load().await?;

        let remote = Arc::new(RemoteStateClient::new(
            Arc::clone(&backend),
            config.remote_timeout(),
        ));
        let keys = CollectionKeyManager::new(Arc::clone(&remote), &credentials, config.kdf.clone());
        let recovery = Arc::new(RecoveryCoordinator::new(backend, &config));

        info!(
            "sync session opened for {} ({} collections)",
            credentials.account_id,
            config.collections.len()
        );

        Ok(Self {
            account_id: Arc::from(credentials.account_id.as_str()),
            config: Arc::new(config),
            remote,
            keys,
            recovery,
            store: Arc::new(store),
            local: Arc::new(RwLock::new(local)),
            synchronizers: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(Mutex::new(())),
            cancel: CancelHandle::default(),
            fresh_starts: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn keys(&self) -> &CollectionKeyManager {
        &self.keys
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Snapshot of the local bookkeeping.
    pub async fn local_state(&self) -> LocalSyncState {
        self.local.read().await.clone()
    }

    /// Number of fresh starts this session has begun.
    pub fn fresh_start_count(&self) -> u64 {
        self.fresh_starts.load(Ordering::SeqCst)
    }

    /// Adds a downstream synchronizer. Runs in registration order.
    pub async fn register(&self, synchronizer: Arc<dyn CollectionSynchronizer>) {
        debug!("registered synchronizer for {}", synchronizer.name());
        self.synchronizers.write().await.push(synchronizer);
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Runs one sync cycle.
    ///
    /// Fails with [`SyncError::CycleInFlight`] if another cycle is running
    /// for this session. On any failure local bookkeeping is left as it was,
    /// except for the reset a completed fresh start performs.
    pub async fn sync(&self) -> SyncResult<CycleReport> {
        let _guard = self.in_flight.try_lock().map_err(|_| {
            warn!("sync requested for {} while a cycle is in flight", self.account_id);
            SyncError::CycleInFlight
        })?;
        self.cancel.clear();

        let mut report = CycleReport {
            states: vec![CycleState::Start],
            ..CycleReport::default()
        };

        match self.run_cycle(&mut report).await {
            Ok(()) => {
                report.enter(CycleState::Done);
                info!(
                    "sync cycle for {} done (fresh start: {}, epoch changed: {})",
                    self.account_id,
                    report.performed_fresh_start(),
                    report.epoch_changed
                );
                Ok(report)
            }
            Err(e) => {
                let at = report.state();
                report.enter(CycleState::Failed);
                if e.is_retryable() {
                    warn!("sync cycle for {} failed in {at}: {e}", self.account_id);
                } else {
                    error!("sync cycle for {} failed in {at}: {e}", self.account_id);
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, report: &mut CycleReport) -> SyncResult<()> {
        report.enter(CycleState::FetchingState);
        let index = self.remote.fetch_collection_index().await?;
        self.checkpoint(report)?;

        report.enter(CycleState::Evaluating);
        let evaluated = self.evaluate_remote(&index).await?;
        // Derived before anything destructive so a KDF failure cannot strand
        // a wiped server.
        let bundle_key = self.keys.bundle_key().await?;
        self.checkpoint(report)?;

        let mut meta = match evaluated {
            Evaluated::Current(meta) => {
                self.observe_epoch(&meta, report).await?;
                meta
            }
            Evaluated::Diverged(reason) => self.fresh_start(reason, &bundle_key, report).await?,
        };
        self.checkpoint(report)?;

        report.enter(CycleState::KeyRefresh);
        self.keys
            .bind_epoch(&meta.sync_id, keys_modified(&index, report))
            .await;
        match self.keys.refresh().await {
            Ok(()) => {}
            Err(e) if e.is_absent_or_malformed() && !report.performed_fresh_start() => {
                warn!("key bundle unusable ({e}), fresh start required");
                meta = self
                    .fresh_start(FreshStartReason::UnusableKeys, &bundle_key, report)
                    .await?;
                report.enter(CycleState::KeyRefresh);
                self.keys
                    .bind_epoch(&meta.sync_id, keys_modified(&index, report))
                    .await;
                self.keys.refresh().await?;
            }
            Err(e) => return Err(e),
        }
        for name in self.config.collection_names() {
            self.keys.get_key_for(name).await?;
        }
        self.checkpoint(report)?;

        report.enter(CycleState::Delegating);
        self.delegate(report).await;

        self.commit(&index, &meta, report).await
    }

    async fn evaluate_remote(&self, index: &CollectionIndex) -> SyncResult<Evaluated> {
        if let Decision::NeedsFreshStart(reason) = evaluator::evaluate(index) {
            info!("collection index inconsistent: {reason}");
            return Ok(Evaluated::Diverged(reason));
        }

        let fetched = self.remote.fetch_global_metadata().await;
        match evaluator::evaluate_metadata_fetch(fetched, self.config.storage_version)? {
            (Decision::Consistent, Some(meta)) => Ok(Evaluated::Current(meta)),
            (Decision::NeedsFreshStart(reason), _) => {
                info!("global metadata inconsistent: {reason}");
                Ok(Evaluated::Diverged(reason))
            }
            (Decision::Consistent, None) => Ok(Evaluated::Diverged(FreshStartReason::UnusableMetadata)),
        }
    }

    /// Resets keys and synchronizers when another client moved the epoch.
    async fn observe_epoch(
        &self,
        meta: &GlobalMetadataRecord,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let changed = evaluator::epoch_changed(meta, &*self.local.read().await);
        if !changed {
            return Ok(());
        }

        info!("server sync epoch is {}, resetting local collections", meta.sync_id);
        report.epoch_changed = true;
        self.keys.invalidate().await;

        let synchronizers = self.synchronizers.read().await.clone();
        for synchronizer in &synchronizers {
            synchronizer.reset_client().await.inspect_err(|e| {
                warn!("failed to reset {} for new epoch: {e}", synchronizer.name());
            })?;
        }
        Ok(())
    }

    async fn fresh_start(
        &self,
        reason: FreshStartReason,
        bundle_key: &DerivedKey,
        report: &mut CycleReport,
    ) -> SyncResult<GlobalMetadataRecord> {
        report.enter(CycleState::FreshStart);
        report.fresh_start = Some(reason);
        self.fresh_starts.fetch_add(1, Ordering::SeqCst);
        info!("performing fresh start for {}: {reason}", self.account_id);

        let synchronizers = self.synchronizers.read().await.clone();
        self.recovery
            .perform_fresh_start(RecoveryContext {
                keys: &self.keys,
                bundle_key,
                local: &self.local,
                store: &self.store,
                synchronizers: &synchronizers,
            })
            .await
    }

    /// Runs every registered synchronizer. Their failures are recorded, not
    /// propagated.
    async fn delegate(&self, report: &mut CycleReport) {
        let synchronizers = self.synchronizers.read().await.clone();
        for synchronizer in synchronizers {
            let name = synchronizer.name().to_string();
            let outcome = match self.keys.get_key_for(&name).await {
                Ok(key) => match synchronizer.sync(&key).await {
                    Ok(()) => CollectionOutcome::Synced,
                    Err(e) => {
                        warn!("synchronizer {name} failed: {e}");
                        CollectionOutcome::Failed(e.to_string())
                    }
                },
                Err(e) => {
                    warn!("no key for {name}, skipping: {e}");
                    CollectionOutcome::Skipped(e.to_string())
                }
            };
            report.outcomes.insert(name, outcome);
        }
    }

    async fn commit(
        &self,
        index: &CollectionIndex,
        meta: &GlobalMetadataRecord,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let mut local = self.local.write().await;
        let next = LocalSyncState {
            last_sync_id: Some(meta.sync_id.clone()),
            // The pre-recovery index is not a known-good baseline.
            index_fingerprint: (!report.performed_fresh_start()).then(|| index.fingerprint()),
            last_sync_at: Some(Utc::now()),
        };
        self.store.save(&next).await?;
        *local = next;
        report.sync_id = Some(meta.sync_id.clone());
        Ok(())
    }

    fn checkpoint(&self, report: &CycleReport) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            let at = report.state();
            info!("sync cycle for {} cancelled at {at}", self.account_id);
            return Err(SyncError::Cancelled { at });
        }
        Ok(())
    }
}

/// Key-bundle timestamp from this cycle's index. Unknown once a fresh start
/// has republished the bundle.
fn keys_modified(index: &CollectionIndex, report: &CycleReport) -> Option<f64> {
    if report.performed_fresh_start() {
        None
    } else {
        index.modified(CRYPTO_COLLECTION)
    }
}
