//! # Registry backup
//!
//! Backs up, restores and verifies the content-addressed blobs of one registry
//! namespace between two object stores.
//!
//! The orchestrators in [`backup`], [`restore`], [`verify`] and [`unlock`] are
//! built from three pieces: the per-namespace [`lock`], the append-only
//! [`inventory`] of numbered backups, and the [`transfer`] worker pool that
//! streams blobs from one [`storage::StorageBucket`] into another.
//!
//! Nothing in this crate reads the environment. Storage handles, the catalog
//! and the run options are passed in explicitly; see [`config`] for the file
//! format used by the command line tool.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod inventory;
pub mod layout;
pub mod lock;
pub mod model;
pub mod restore;
pub mod transfer;
pub mod unlock;
pub mod verify;

pub use backup::{BackupOptions, BackupOutcome};
pub use catalog::{Catalog, CatalogError, MemoryCatalog};
pub use config::{Config, ConfigError};
pub use error::{BackupError, BackupResult, Stage};
pub use inventory::{BackupStatus, InventoryRecord, Summary};
pub use model::{Digest, InvalidDigest, Namespace};
pub use restore::{RestoreOptions, RestoreOutcome};
pub use transfer::{TransferOptions, TransferReport, TransferTask};
pub use verify::{VerifyReport, VerifyStatus};

/// Default bucket holding backups, as used by the command line tool.
pub const DEFAULT_BUCKET: &str = "quaybackup";

/// Default size of the transfer worker pool.
pub const DEFAULT_WORKERS: usize = 5;
