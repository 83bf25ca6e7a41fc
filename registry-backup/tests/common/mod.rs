#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camino::Utf8Path;
use sha2::{Digest as _, Sha256};
use storage::{
    Driver, MemoryStorage, Metadata, Reader, Storage, StorageBucket, StorageError,
    StorageErrorKind, Writer,
};

use registry_backup::catalog::MemoryCatalog;
use registry_backup::layout::NamespaceKeys;
use registry_backup::Digest;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("registry_backup=debug")
        .try_init();
}

pub fn digest_of(data: &[u8]) -> Digest {
    Digest::parse(&hex::encode(Sha256::digest(data))).unwrap()
}

/// Calls made through a [`CountingDriver`].
#[derive(Debug, Default)]
pub struct Counts {
    pub metadata: AtomicUsize,
    pub download: AtomicUsize,
    pub upload: AtomicUsize,
    pub delete: AtomicUsize,
    pub list: AtomicUsize,
}

impl Counts {
    pub fn writes(&self) -> usize {
        self.upload.load(Ordering::SeqCst) + self.delete.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.writes()
            + self.metadata.load(Ordering::SeqCst)
            + self.download.load(Ordering::SeqCst)
            + self.list.load(Ordering::SeqCst)
    }
}

/// A memory driver that counts calls.
#[derive(Debug, Default)]
pub struct CountingDriver {
    inner: MemoryStorage,
    pub counts: Counts,
}

#[async_trait::async_trait]
impl Driver for CountingDriver {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.counts.delete.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.counts.metadata.fetch_add(1, Ordering::SeqCst);
        self.inner.metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.counts.upload.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(bucket, remote, reader).await
    }

    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.counts.upload.fetch_add(1, Ordering::SeqCst);
        self.inner.upload_new(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.counts.download.fetch_add(1, Ordering::SeqCst);
        self.inner.download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.counts.list.fetch_add(1, Ordering::SeqCst);
        self.inner.list(bucket, prefix).await
    }
}

/// A memory driver whose downloads fail or panic for chosen keys.
#[derive(Debug, Default)]
pub struct FaultyDriver {
    inner: MemoryStorage,
    fail: HashSet<String>,
    panic: HashSet<String>,
}

impl FaultyDriver {
    pub fn failing(mut self, key: impl Into<String>) -> Self {
        self.fail.insert(key.into());
        self
    }

    pub fn panicking(mut self, key: impl Into<String>) -> Self {
        self.panic.insert(key.into());
        self
    }
}

#[async_trait::async_trait]
impl Driver for FaultyDriver {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.inner.delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.inner.metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.inner.upload(bucket, remote, reader).await
    }

    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.inner.upload_new(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        if self.panic.contains(remote.as_str()) {
            panic!("injected panic for {remote}");
        }
        if self.fail.contains(remote.as_str()) {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::ServiceUnavailable,
                "injected failure",
            )
            .path(remote.as_str())
            .build());
        }
        self.inner.download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.list(bucket, prefix).await
    }
}

pub fn memory_bucket(name: &str) -> StorageBucket {
    Storage::new(MemoryStorage::new()).bucket(name)
}

pub fn counting_bucket(name: &str) -> (Arc<CountingDriver>, StorageBucket) {
    let driver = Arc::new(CountingDriver::default());
    let bucket = Storage::from_arc(driver.clone()).bucket(name);
    (driver, bucket)
}

/// A namespace `acme` with two repositories sharing one blob, and a
/// registry bucket holding every blob.
pub struct Fixture {
    pub catalog: Arc<MemoryCatalog>,
    pub blobs: Vec<(Digest, &'static [u8])>,
}

pub const WEB_BLOBS: [&[u8]; 3] = [b"web layer one", b"shared base layer", b"web config"];
pub const API_BLOBS: [&[u8]; 2] = [b"shared base layer", b"api config"];

impl Fixture {
    pub fn new() -> Self {
        let sized = |data: &[u8]| (digest_of(data), data.len() as u64);
        let web: Vec<_> = WEB_BLOBS.iter().map(|d| sized(d)).collect();
        let api: Vec<_> = API_BLOBS.iter().map(|d| sized(d)).collect();

        let catalog = MemoryCatalog::new()
            .with_namespace("1", "acme")
            .with_repository("10", "web")
            .with_manifest(digest_of(b"web manifest"), &web)
            .with_repository("11", "api")
            .with_manifest(digest_of(b"api manifest"), &api)
            .with_manifest_list(
                digest_of(b"api index"),
                &[digest_of(b"api manifest")],
            );

        let mut blobs: Vec<(Digest, &'static [u8])> = Vec::new();
        for data in WEB_BLOBS.iter().chain(API_BLOBS.iter()) {
            let digest = digest_of(data);
            if !blobs.iter().any(|(d, _)| *d == digest) {
                blobs.push((digest, *data));
            }
        }

        Self {
            catalog: Arc::new(catalog),
            blobs,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|(_, data)| data.len() as u64).sum()
    }

    pub async fn seed(&self, registry: &StorageBucket) {
        let keys = NamespaceKeys::new("acme");
        for (digest, data) in &self.blobs {
            registry.put_bytes(&keys.blob(digest), data).await.unwrap();
        }
    }
}
