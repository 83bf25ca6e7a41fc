use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

type Bucket = HashMap<Utf8PathBuf, MemoryObject>;

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryObject {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryObject {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
///
/// Buckets are created on first upload. Conditional uploads are atomic: the
/// existence check and the insert happen under one write lock.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), HashMap::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    fn bucket_not_found(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            format!("Bucket not found: {bucket}"),
        )
        .bucket(bucket)
        .build()
    }

    fn object_not_found(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            format!("Object not found: {remote}"),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build()
    }

    async fn read_all(&self, reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err).context("read upload").build())?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        objects
            .get(remote)
            .map(Metadata::from)
            .ok_or_else(|| self.object_not_found(bucket, remote))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        objects
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| self.object_not_found(bucket, remote))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = self.read_all(reader).await?;

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = self.read_all(reader).await?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        if objects.contains_key(remote) {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::AlreadyExists,
                format!("Object already exists: {remote}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        objects.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let object = {
            let buckets = self.buckets.read().await;
            let objects = buckets
                .get(bucket)
                .ok_or_else(|| self.bucket_not_found(bucket))?;
            objects
                .get(remote)
                .ok_or_else(|| self.object_not_found(bucket, remote))?
                .clone()
        };

        // Release the lock before writing.
        let mut data = object.as_ref();
        tokio::io::copy(&mut data, writer)
            .await
            .map_err(|err| StorageError::io(self.name(), err).path(remote.as_str()).build())?;

        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err).path(remote.as_str()).build())?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut keys: Vec<String> = objects
            .keys()
            .filter(|key| prefix.map_or(true, |prefix| key.starts_with(prefix)))
            .map(|key| key.to_string())
            .collect();
        keys.sort();

        Ok(keys)
    }
}
