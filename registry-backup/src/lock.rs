//! The per-namespace backup lock.
//!
//! The lock is the presence of one marker object, `{namespace}/backup/lock`,
//! in the backup bucket. The marker body is a [`Lease`] describing who took
//! it, which is only used for reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::{StorageBucket, StorageError, StorageErrorKind};

use crate::error::{BackupError, BackupResult};
use crate::layout::NamespaceKeys;

/// Who took a lock, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Process id of the holder.
    pub owner: u32,

    /// Random token identifying this acquisition.
    pub token: String,

    /// When the lock was taken.
    pub acquired: DateTime<Utc>,
}

impl Lease {
    fn new() -> Self {
        Self {
            owner: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired: Utc::now(),
        }
    }
}

/// What the lock marker currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No marker.
    Unlocked,

    /// A marker exists. The lease is `None` when its body is unreadable.
    Held(Option<Lease>),
}

impl LockState {
    /// Whether a marker exists.
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Held(_))
    }
}

/// Creates, inspects and removes lock markers in the backup bucket.
#[derive(Debug, Clone)]
pub struct LockManager {
    bucket: StorageBucket,
}

impl LockManager {
    /// Manage locks stored in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// Take the lock for `namespace`.
    ///
    /// Fails with [`BackupError::LockHeld`] when a marker is present, including
    /// when a concurrent caller created it between the check and the write.
    #[tracing::instrument(skip(self))]
    pub async fn try_acquire(&self, namespace: &str) -> BackupResult<Lease> {
        let key = NamespaceKeys::new(namespace).lock();
        if self.bucket.exists(&key).await? {
            tracing::warn!(%key, "Lock already held");
            return Err(BackupError::LockHeld(namespace.to_owned()));
        }

        let lease = Lease::new();
        let body = serde_json::to_vec(&lease)
            .map_err(StorageError::with("lock", StorageErrorKind::SerializationError))?;

        match self.bucket.upload_new(&key, &mut body.as_slice()).await {
            Ok(()) => {
                tracing::info!(%key, token = %lease.token, "Acquired lock");
                Ok(lease)
            }
            Err(error) if error.kind() == StorageErrorKind::AlreadyExists => {
                tracing::warn!(%key, "Lost race for lock");
                Err(BackupError::LockHeld(namespace.to_owned()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Remove the lock for `namespace`. Removing an absent lock is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, namespace: &str) -> BackupResult<()> {
        self.remove(namespace).await.map(|_| ())
    }

    /// Remove the lock for `namespace` regardless of who holds it, reporting
    /// whether a marker existed.
    #[tracing::instrument(skip(self))]
    pub async fn force_unlock(&self, namespace: &str) -> BackupResult<bool> {
        self.remove(namespace).await
    }

    /// Whether `namespace` is locked.
    pub async fn is_locked(&self, namespace: &str) -> BackupResult<bool> {
        let key = NamespaceKeys::new(namespace).lock();
        Ok(self.bucket.exists(&key).await?)
    }

    /// Read the lock marker for `namespace`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn inspect(&self, namespace: &str) -> BackupResult<LockState> {
        let key = NamespaceKeys::new(namespace).lock();
        let body = match self.bucket.get_bytes(&key).await {
            Ok(body) => body,
            Err(error) if error.is_not_found() => return Ok(LockState::Unlocked),
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_slice(&body) {
            Ok(lease) => Ok(LockState::Held(Some(lease))),
            Err(error) => {
                tracing::warn!(%key, %error, "Unreadable lock marker");
                Ok(LockState::Held(None))
            }
        }
    }

    async fn remove(&self, namespace: &str) -> BackupResult<bool> {
        let key = NamespaceKeys::new(namespace).lock();
        match self.bucket.delete(&key).await {
            Ok(()) => {
                tracing::info!(%key, "Removed lock");
                Ok(true)
            }
            Err(error) if error.is_not_found() => {
                tracing::debug!(%key, "No lock to remove");
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }
}
