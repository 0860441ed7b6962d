//! Sync error types.

use crate::recovery::RecoveryStep;
use crate::types::CycleState;
use cairn_crypto::CryptoError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage server unreachable: {0}")]
    Unreachable(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed remote record: {0}")]
    Malformed(String),

    #[error("key bundle could not be decrypted (wrong passphrase or corrupted bundle)")]
    DecryptFailed,

    #[error("fresh start interrupted at step {step}: {reason}")]
    PartialFailure { step: RecoveryStep, reason: String },

    #[error("collection keys not available: {0}")]
    NotAvailable(String),

    #[error("server storage version {remote} is newer than supported version {local}")]
    ClientOutdated { remote: u32, local: u32 },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("a sync cycle is already in flight for this account")]
    CycleInFlight,

    #[error("sync cycle cancelled at {at}")]
    Cancelled { at: CycleState },

    #[error("local sync state error: {0}")]
    LocalState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SyncError {
    /// True for failures that the next cycle may clear on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable(_)
                | SyncError::Timeout { .. }
                | SyncError::PartialFailure { .. }
                | SyncError::CycleInFlight
        )
    }

    /// True when a remote record is missing or undecodable. Both mean the
    /// record cannot be trusted and are handled the same way.
    pub fn is_absent_or_malformed(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::Malformed(_))
    }
}
