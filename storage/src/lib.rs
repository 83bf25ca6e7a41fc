//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Which driver to build, as written in configuration files.
///
/// ```toml
/// driver = { local = { path = "/srv/backups" } }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Objects held in process memory.
    Memory,

    /// Objects stored under a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory; buckets are its subdirectories.
        path: Utf8PathBuf,
    },

    /// Objects stored in a temporary directory removed on exit.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::create()?.into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to one storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Wrap an already shared driver, so the caller can keep a typed handle to it.
    pub fn from_arc<D: Driver + Send + Sync + 'static>(driver: Arc<D>) -> Self {
        Self { driver }
    }

    /// The driver name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to one bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }

    /// Get the metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    /// Download an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        self.driver.download(bucket, remote, writer).await
    }

    /// Upload an object from `reader`, replacing any existing object.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        self.driver.upload(bucket, remote, reader).await
    }

    /// List object keys, optionally under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, path).await
    }
}

/// A storage handle bound to one bucket.
///
/// This is the unit the backup engine works with: every key it reads or
/// writes is relative to the bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.bucket
    }

    /// The driver name.
    pub fn driver(&self) -> &'static str {
        self.driver.name()
    }

    /// Get the metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Check whether an object exists.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(driver = self.driver.name(), bucket = self.bucket)
    )]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Download an object into `writer`.
    #[tracing::instrument(
        skip(self, writer),
        fields(driver = self.driver.name(), bucket = self.bucket)
    )]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await
    }

    /// Upload an object from `reader`, replacing any existing object.
    #[tracing::instrument(
        skip(self, reader),
        fields(driver = self.driver.name(), bucket = self.bucket)
    )]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Upload an object only if the key is free.
    ///
    /// Fails with [`StorageErrorKind::AlreadyExists`] when an object is present.
    #[tracing::instrument(
        skip(self, reader),
        fields(driver = self.driver.name(), bucket = self.bucket)
    )]
    pub async fn upload_new<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Creating: {}/{remote}", self.bucket);
        self.driver.upload_new(&self.bucket, remote, reader).await
    }

    /// Read a whole object into memory.
    pub async fn get_bytes(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        self.download(remote, &mut buf).await?;
        Ok(buf)
    }

    /// Write a whole object from memory, replacing any existing object.
    pub async fn put_bytes(&self, remote: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        let mut reader = data;
        self.upload(remote, &mut reader).await
    }

    /// List object keys, optionally under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}
