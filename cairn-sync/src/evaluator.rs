//! Pure divergence detection.
//!
//! Metadata and keys are co-required: if either is missing or unusable,
//! cryptographic trust cannot be established and the only answer is a full
//! fresh start.

use crate::error::{SyncError, SyncResult};
use crate::state::LocalSyncState;
use crate::types::{CollectionIndex, GlobalMetadataRecord, CRYPTO_COLLECTION, META_COLLECTION};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Outcome of evaluating remote state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Consistent,
    NeedsFreshStart(FreshStartReason),
}

impl Decision {
    pub fn needs_fresh_start(&self) -> bool {
        matches!(self, Decision::NeedsFreshStart(_))
    }
}

/// Why a fresh start was required.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshStartReason {
    /// The index has no metadata collection.
    MissingMetadata,
    /// The index has no key-bundle collection.
    MissingKeys,
    /// Metadata listed but absent or undecodable.
    UnusableMetadata,
    /// Key bundle listed but absent or undecodable.
    UnusableKeys,
    /// Server data predates our storage format.
    OutdatedStorage { remote: u32 },
}

impl fmt::Display for FreshStartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreshStartReason::MissingMetadata => f.write_str("metadata collection missing"),
            FreshStartReason::MissingKeys => f.write_str("key-bundle collection missing"),
            FreshStartReason::UnusableMetadata => f.write_str("metadata record unusable"),
            FreshStartReason::UnusableKeys => f.write_str("key bundle unusable"),
            FreshStartReason::OutdatedStorage { remote } => {
                write!(f, "server storage version {remote} is outdated")
            }
        }
    }
}

/// Decides from the collection index alone.
pub fn evaluate(index: &CollectionIndex) -> Decision {
    if !index.contains(META_COLLECTION) {
        Decision::NeedsFreshStart(FreshStartReason::MissingMetadata)
    } else if !index.contains(CRYPTO_COLLECTION) {
        Decision::NeedsFreshStart(FreshStartReason::MissingKeys)
    } else {
        Decision::Consistent
    }
}

/// Checks a fetched metadata record against our storage format.
///
/// A newer remote format cannot be fixed by wiping; it fails with
/// [`SyncError::ClientOutdated`].
pub fn evaluate_metadata(meta: &GlobalMetadataRecord, storage_version: u32) -> SyncResult<Decision> {
    match meta.storage_version.cmp(&storage_version) {
        Ordering::Equal => Ok(Decision::Consistent),
        Ordering::Less => Ok(Decision::NeedsFreshStart(FreshStartReason::OutdatedStorage {
            remote: meta.storage_version,
        })),
        Ordering::Greater => Err(SyncError::ClientOutdated {
            remote: meta.storage_version,
            local: storage_version,
        }),
    }
}

/// Maps a metadata fetch result to a decision. Absent or malformed metadata
/// is a divergence; transport errors propagate.
pub fn evaluate_metadata_fetch(
    fetched: SyncResult<GlobalMetadataRecord>,
    storage_version: u32,
) -> SyncResult<(Decision, Option<GlobalMetadataRecord>)> {
    match fetched {
        Ok(meta) => {
            let decision = evaluate_metadata(&meta, storage_version)?;
            Ok((decision, Some(meta)))
        }
        Err(e) if e.is_absent_or_malformed() => Ok((
            Decision::NeedsFreshStart(FreshStartReason::UnusableMetadata),
            None,
        )),
        Err(e) => Err(e),
    }
}

/// True when the server's sync epoch is not the one we last completed a
/// cycle under. Another client may have performed a fresh start.
pub fn epoch_changed(meta: &GlobalMetadataRecord, local: &LocalSyncState) -> bool {
    local.last_sync_id.as_deref() != Some(meta.sync_id.as_str())
}
