//! Configuration file for the command line tool.
//!
//! ```toml
//! bucket = "quaybackup"
//! workers = 5
//!
//! [registry]
//! bucket = "registry"
//! driver = { local = { path = "/datastorage/registry" } }
//!
//! [backup]
//! driver = { local = { path = "/srv/backups" } }
//!
//! [catalog]
//! snapshot = "/etc/registry-backup/catalog.json"
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::{StorageBucket, StorageConfig, StorageError};

use crate::catalog::{CatalogError, MemoryCatalog};
use crate::error::BackupResult;

/// Where the tool looks when no configuration path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/registry-backup/config.toml";

/// Errors loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config file {path}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("parsing config file {path}")]
    Parse {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A storage driver could not be built.
    #[error("building storage driver")]
    Storage(#[from] StorageError),
}

fn default_workers() -> usize {
    crate::DEFAULT_WORKERS
}

fn default_registry_bucket() -> String {
    "registry".to_owned()
}

/// The registry storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryStorageConfig {
    /// Bucket holding the registry blobs.
    #[serde(default = "default_registry_bucket")]
    pub bucket: String,

    /// Storage driver.
    pub driver: StorageConfig,
}

/// The backup storage. Its bucket comes from [`Config::bucket`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupStorageConfig {
    /// Storage driver.
    pub driver: StorageConfig,
}

/// Where namespace contents are enumerated from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    /// JSON snapshot of the registry database.
    #[serde(default)]
    pub snapshot: Option<Utf8PathBuf>,
}

/// Top level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Backup bucket. The command line flag takes precedence.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Transfer workers, when not given on the command line.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Registry storage.
    pub registry: RegistryStorageConfig,

    /// Backup storage.
    pub backup: BackupStorageConfig,

    /// Catalog source.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl Config {
    /// Parse and validate TOML.
    pub fn parse(path: &Utf8Path, text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a file.
    #[tracing::instrument]
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.bucket.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid("bucket must not be empty".into()));
        }
        if self.registry.bucket.is_empty() {
            return Err(ConfigError::Invalid("registry bucket must not be empty".into()));
        }
        Ok(())
    }

    /// The backup bucket name: `flag`, then the file, then the default.
    pub fn backup_bucket_name(&self, flag: Option<&str>) -> String {
        flag.or(self.bucket.as_deref())
            .unwrap_or(crate::DEFAULT_BUCKET)
            .to_owned()
    }

    /// Build the registry bucket handle.
    pub fn registry_bucket(&self) -> Result<StorageBucket, ConfigError> {
        let storage = self.registry.driver.clone().build()?;
        Ok(storage.bucket(self.registry.bucket.clone()))
    }

    /// Build the backup bucket handle.
    pub fn backup_bucket(&self, flag: Option<&str>) -> Result<StorageBucket, ConfigError> {
        let name = self.backup_bucket_name(flag);
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConfigError::Invalid(format!("bad backup bucket name {name:?}")));
        }
        let storage = self.backup.driver.clone().build()?;
        Ok(storage.bucket(name))
    }

    /// The registry and backup buckets, in that order.
    pub fn buckets(&self, flag: Option<&str>) -> BackupResult<(StorageBucket, StorageBucket)> {
        Ok((self.registry_bucket()?, self.backup_bucket(flag)?))
    }

    /// Load the catalog. Without a snapshot the catalog is empty.
    pub async fn catalog(&self) -> Result<MemoryCatalog, CatalogError> {
        match &self.catalog.snapshot {
            Some(path) => MemoryCatalog::from_file(path).await,
            None => {
                tracing::warn!("No catalog snapshot configured");
                Ok(MemoryCatalog::new())
            }
        }
    }
}
