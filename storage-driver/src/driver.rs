use std::fmt;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with an object storage backend.
///
/// Keys are `/`-separated paths relative to the bucket. Callers never branch on the
/// concrete driver; everything they need is expressed through this trait.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Delete an object from the storage, by key.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object, by key.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether an object exists.
    ///
    /// Only a [`StorageErrorKind::NotFound`] answer from [`Driver::metadata`] means "absent";
    /// every other error is propagated.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Upload an object to the storage, using a reader stream to provide the contents.
    ///
    /// Existing objects are replaced.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Upload an object only if no object exists at `remote`.
    ///
    /// Fails with [`StorageErrorKind::AlreadyExists`] otherwise. Drivers with a native
    /// conditional write should override this. The default is a check followed by a put,
    /// which leaves a window where two callers can both succeed.
    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        if self.exists(bucket, remote).await? {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::AlreadyExists,
                format!("object already exists: {remote}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        self.upload(bucket, remote, reader).await
    }

    /// Download an object from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the object keys in a bucket, optionally filtered by a prefix.
    ///
    /// Returned keys are full keys relative to the bucket, not relative to the prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;
}
