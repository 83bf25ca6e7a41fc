//! Removing a stale namespace lock.
//!
//! This does not check whether a backup is still running; removing the lock
//! of a live backup lets a second backup race it for the next inventory.

use storage::StorageBucket;

use crate::error::BackupResult;
use crate::layout::check_namespace;
use crate::lock::{Lease, LockManager, LockState};

/// Result of an unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockReport {
    /// Namespace unlocked.
    pub namespace: String,

    /// Whether a lock marker was removed.
    pub lock_existed: bool,

    /// The removed lease, when its marker was readable.
    pub lease: Option<Lease>,

    /// Human readable outcome.
    pub message: String,
}

/// Remove the lock of `namespace` from `backups`.
#[tracing::instrument(skip(backups), fields(bucket = backups.name()))]
pub async fn unlock(backups: &StorageBucket, namespace: &str) -> BackupResult<UnlockReport> {
    check_namespace(namespace)?;
    let locks = LockManager::new(backups.clone());

    let lease = match locks.inspect(namespace).await? {
        LockState::Held(lease) => lease,
        LockState::Unlocked => None,
    };
    let lock_existed = locks.force_unlock(namespace).await?;

    let message = if lock_existed {
        format!("Successfully removed backup lock for namespace '{namespace}'")
    } else {
        format!("No backup lock found for namespace '{namespace}'")
    };
    tracing::info!("{message}");

    Ok(UnlockReport {
        namespace: namespace.to_owned(),
        lock_existed,
        lease,
        message,
    })
}
