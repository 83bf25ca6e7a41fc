use std::io;

use camino::Utf8Path;
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// A storage driver that stores objects in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing objects in a fresh temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "temporary path is not UTF-8")
            })?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// Build a `TempDriver`, reporting failures as storage errors.
    pub fn create() -> Result<Self, StorageError> {
        Self::new().map_err(StorageError::with("temp", StorageErrorKind::Io))
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, reader).await
    }

    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload_new(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}
