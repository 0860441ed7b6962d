//! Client-side consistency and recovery engine for cairn sync.
//!
//! Before any collection is synchronized, a [`SyncSession`] inspects the
//! server's bookkeeping (collection index, global metadata, key bundle) and
//! decides whether the account's cryptographic state can be trusted:
//! - [`evaluator`] decides, purely from remote state, whether a fresh start is needed
//! - [`recovery`] wipes the server and republishes keys and metadata
//! - [`key_manager`] caches decrypted collection keys for the current sync epoch
//! - [`session`] drives one cycle at a time and hands validated keys to
//!   registered [`CollectionSynchronizer`]s

pub mod backend;
pub mod bundle;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod http_backend;
pub mod key_manager;
pub mod recovery;
pub mod remote_state;
pub mod session;
pub mod state;
pub mod synchronizer;
pub mod types;

pub use backend::StorageBackend;
pub use config::{AccountCredentials, CollectionConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use evaluator::{Decision, FreshStartReason};
pub use session::{CancelHandle, SyncSession};
pub use synchronizer::{CollectionOutcome, CollectionSynchronizer};
pub use types::*;
