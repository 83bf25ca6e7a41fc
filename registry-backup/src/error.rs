//! Error types for backup, restore, verify and unlock runs.

use std::fmt;

use storage::StorageError;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::inventory::BackupStatus;

/// Result type for orchestrator operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// The step of a backup run that failed after enumeration began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Listing repositories and manifests from the catalog.
    Enumerate,

    /// Copying blobs with the worker pool.
    Transfer,

    /// Writing the inventory record.
    WriteInventory,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Enumerate => f.write_str("enumerate"),
            Stage::Transfer => f.write_str("transfer"),
            Stage::WriteInventory => f.write_str("write inventory"),
        }
    }
}

/// Errors that end a run.
///
/// Failures of individual blob transfers are not errors at this level; they
/// are collected in a [`crate::TransferReport`].
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Another backup holds the namespace lock.
    #[error("backup in progress for namespace {0}")]
    LockHeld(String),

    /// The catalog has no namespace with this name.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// The requested inventory does not exist, or there are none at all.
    #[error("{} not found for namespace {namespace}", which(.number))]
    BackupNotFound {
        /// Namespace name.
        namespace: String,
        /// Requested backup, `None` when the latest was requested.
        number: Option<u64>,
    },

    /// An inventory exists but could not be parsed.
    #[error("inventory {number} for namespace {namespace} is corrupt")]
    CorruptInventory {
        /// Namespace name.
        namespace: String,
        /// Backup number.
        number: u64,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The selected inventory cannot be restored from.
    #[error("cannot restore from backup {number} with status {status}")]
    ValidationFailed {
        /// Backup number.
        number: u64,
        /// Recorded status.
        status: BackupStatus,
    },

    /// A repository filter named a repository the inventory does not contain.
    #[error("repository {repository} is not in backup {number}")]
    RepositoryNotInBackup {
        /// Requested repository.
        repository: String,
        /// Backup number.
        number: u64,
    },

    /// An inventory with this number was already written.
    #[error("inventory {number} already exists for namespace {namespace}")]
    InventoryExists {
        /// Namespace name.
        namespace: String,
        /// Backup number.
        number: u64,
    },

    /// The namespace name cannot be used as a key prefix.
    #[error("invalid namespace name: {0:?}")]
    InvalidNamespace(String),

    /// A storage call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The catalog could not be read.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A transfer worker panicked.
    #[error("transfer worker panicked")]
    WorkerPanicked(#[source] tokio::task::JoinError),

    /// A backup failed after its number was chosen. A `Failed` inventory
    /// was written under `number` when possible.
    #[error("backup {number} aborted during {stage}")]
    Aborted {
        /// Backup number.
        number: u64,
        /// The failing step.
        stage: Stage,
        /// The underlying failure.
        #[source]
        source: Box<BackupError>,
    },
}

fn which(number: &Option<u64>) -> String {
    match number {
        Some(number) => format!("backup {number}"),
        None => "latest backup".to_owned(),
    }
}

impl BackupError {
    /// The innermost error, looking through [`BackupError::Aborted`].
    pub fn root(&self) -> &BackupError {
        match self {
            BackupError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }
}
