use std::collections::BTreeSet;
use std::sync::Arc;

use registry_backup::backup::{Backup, BackupOptions};
use registry_backup::catalog::{Catalog, CatalogError, MemoryCatalog};
use registry_backup::inventory::InventoryManager;
use registry_backup::layout::NamespaceKeys;
use registry_backup::lock::LockManager;
use registry_backup::model::{ManifestBlobs, RepositoryRef};
use registry_backup::{BackupError, BackupStatus, Namespace, Stage};
use storage::Storage;

mod common;

use common::{counting_bucket, memory_bucket, Fixture, FaultyDriver};

fn options(workers: usize) -> BackupOptions {
    BackupOptions {
        workers,
        verify_digests: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn backup_numbers_increase_from_one() {
    common::init_tracing();
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let backup = Backup::new(fixture.catalog.clone(), registry, backups.clone(), options(4));
    let first = backup.run("acme").await.unwrap();
    let second = backup.run("acme").await.unwrap();

    assert_eq!(first.backup_number, 1);
    assert_eq!(second.backup_number, 2);

    let inventories = InventoryManager::new(backups.clone());
    assert_eq!(
        inventories.list("acme").await.unwrap(),
        BTreeSet::from([1, 2])
    );
    assert!(!LockManager::new(backups).is_locked("acme").await.unwrap());
}

#[tokio::test]
async fn first_backup_copies_every_distinct_blob() {
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let outcome = Backup::new(fixture.catalog.clone(), registry, backups.clone(), options(3))
        .run("acme")
        .await
        .unwrap();

    assert_eq!(outcome.report.total, fixture.blobs.len());
    assert_eq!(outcome.report.transferred, fixture.blobs.len());
    assert_eq!(outcome.report.bytes, fixture.total_bytes());
    assert_eq!(outcome.record.summary.status, BackupStatus::Success);
    assert_eq!(outcome.record.summary.repositories_created, 2);
    assert_eq!(outcome.record.summary.manifests_created, 3);

    let keys = NamespaceKeys::new("acme");
    for (digest, data) in &fixture.blobs {
        assert_eq!(&backups.get_bytes(&keys.blob(digest)).await.unwrap(), data);
    }

    let stored = InventoryManager::new(backups).load("acme", 1).await.unwrap();
    assert_eq!(stored.namespace_name, "acme");
    assert_eq!(stored.namespace_id, "1");
    assert_eq!(stored.blobs().len(), fixture.blobs.len());
    let api = stored.repository("api").unwrap();
    assert_eq!(api.manifests.len(), 2);
}

#[tokio::test]
async fn second_backup_skips_every_blob() {
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let backup = Backup::new(fixture.catalog.clone(), registry, backups, options(5));
    backup.run("acme").await.unwrap();
    let again = backup.run("acme").await.unwrap();

    assert_eq!(again.report.transferred, 0);
    assert_eq!(again.report.skipped, again.report.total);
    assert_eq!(again.record.summary.data.blobs, 0);
    assert_eq!(again.record.summary.data.bytes_written, 0);
    assert_eq!(again.record.summary.status, BackupStatus::Success);
}

#[tokio::test]
async fn forced_backup_copies_again() {
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    Backup::new(fixture.catalog.clone(), registry.clone(), backups.clone(), options(2))
        .run("acme")
        .await
        .unwrap();
    let forced = Backup::new(
        fixture.catalog.clone(),
        registry,
        backups,
        BackupOptions {
            force_blobs: true,
            ..options(2)
        },
    )
    .run("acme")
    .await
    .unwrap();

    assert_eq!(forced.report.skipped, 0);
    assert_eq!(forced.report.transferred, fixture.blobs.len());
}

#[tokio::test]
async fn held_lock_stops_backup_before_any_transfer() {
    let fixture = Fixture::new();
    let (registry_driver, registry) = counting_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;
    let seeded = registry_driver.counts.total();

    let locks = LockManager::new(backups.clone());
    locks.try_acquire("acme").await.unwrap();

    let err = Backup::new(fixture.catalog.clone(), registry, backups.clone(), options(5))
        .run("acme")
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::LockHeld(ref ns) if ns == "acme"));
    assert_eq!(registry_driver.counts.total(), seeded);
    assert!(InventoryManager::new(backups).list("acme").await.unwrap().is_empty());
    assert!(locks.is_locked("acme").await.unwrap(), "foreign lock untouched");
}

#[tokio::test]
async fn unknown_namespace_releases_lock() {
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");

    let err = Backup::new(
        Arc::new(MemoryCatalog::new()),
        registry,
        backups.clone(),
        options(1),
    )
    .run("ghost")
    .await
    .unwrap_err();

    assert!(matches!(err, BackupError::NamespaceNotFound(ref ns) if ns == "ghost"));
    assert!(!LockManager::new(backups.clone()).is_locked("ghost").await.unwrap());
    assert!(InventoryManager::new(backups).list("ghost").await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_count_does_not_change_totals() {
    let fixture = Fixture::new();
    let mut runs = Vec::new();

    for workers in [1, 20] {
        let registry = memory_bucket("registry");
        let backups = memory_bucket("backups");
        fixture.seed(&registry).await;

        let outcome = Backup::new(fixture.catalog.clone(), registry, backups, options(workers))
            .run("acme")
            .await
            .unwrap();
        let blobs: BTreeSet<String> = outcome
            .record
            .blobs()
            .into_iter()
            .map(|d| d.to_string())
            .collect();
        runs.push((
            outcome.report.total,
            outcome.report.transferred,
            outcome.report.bytes,
            blobs,
        ));
    }

    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn concurrent_lock_attempts_admit_one() {
    let backups = memory_bucket("backups");

    let mut attempts = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let locks = LockManager::new(backups.clone());
        attempts.spawn(async move { locks.try_acquire("acme").await });
    }

    let mut acquired = 0;
    while let Some(result) = attempts.join_next().await {
        match result.unwrap() {
            Ok(_) => acquired += 1,
            Err(BackupError::LockHeld(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test]
async fn failed_download_records_failed_backup() {
    let fixture = Fixture::new();
    let keys = NamespaceKeys::new("acme");
    let (broken, _) = &fixture.blobs[0];

    let registry =
        Storage::new(FaultyDriver::default().failing(keys.blob(broken).into_string()))
            .bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let outcome = Backup::new(fixture.catalog.clone(), registry, backups.clone(), options(3))
        .run("acme")
        .await
        .unwrap();

    assert_eq!(outcome.report.failed.len(), 1);
    assert_eq!(&outcome.report.failed[0].digest, broken);
    assert_eq!(outcome.report.transferred, fixture.blobs.len() - 1);
    assert_eq!(outcome.record.summary.status, BackupStatus::Failed);
    assert!(!backups.exists(&keys.blob(broken)).await.unwrap());

    let stored = InventoryManager::new(backups).load("acme", 1).await.unwrap();
    assert_eq!(stored.summary.status, BackupStatus::Failed);
}

#[tokio::test]
async fn blob_missing_from_registry_fails_the_task() {
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    // Seed all but the last blob.
    let keys = NamespaceKeys::new("acme");
    let (missing, _) = fixture.blobs.last().unwrap();
    for (digest, data) in &fixture.blobs[..fixture.blobs.len() - 1] {
        registry.put_bytes(&keys.blob(digest), data).await.unwrap();
    }

    let outcome = Backup::new(fixture.catalog.clone(), registry, backups, options(2))
        .run("acme")
        .await
        .unwrap();

    assert_eq!(outcome.report.failed.len(), 1);
    assert_eq!(&outcome.report.failed[0].digest, missing);
    assert_eq!(outcome.record.summary.status, BackupStatus::Failed);
}

#[tokio::test]
async fn worker_panic_aborts_backup() {
    let fixture = Fixture::new();
    let keys = NamespaceKeys::new("acme");
    let (poisoned, _) = &fixture.blobs[1];

    let registry =
        Storage::new(FaultyDriver::default().panicking(keys.blob(poisoned).into_string()))
            .bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let err = Backup::new(fixture.catalog.clone(), registry, backups.clone(), options(2))
        .run("acme")
        .await
        .unwrap_err();

    match &err {
        BackupError::Aborted { number, stage, .. } => {
            assert_eq!(*number, 1);
            assert_eq!(*stage, Stage::Transfer);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root(), BackupError::WorkerPanicked(_)));

    let stored = InventoryManager::new(backups.clone()).load("acme", 1).await.unwrap();
    assert_eq!(stored.summary.status, BackupStatus::Failed);
    assert!(!LockManager::new(backups).is_locked("acme").await.unwrap());
}

/// A catalog whose manifest listing fails for one repository.
#[derive(Debug)]
struct Flaky {
    inner: MemoryCatalog,
    broken: &'static str,
}

#[async_trait::async_trait]
impl Catalog for Flaky {
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, CatalogError> {
        self.inner.namespace(name).await
    }

    async fn repositories(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<RepositoryRef>, CatalogError> {
        self.inner.repositories(namespace).await
    }

    async fn manifests(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Vec<ManifestBlobs>, CatalogError> {
        if repository.name == self.broken {
            return Err(CatalogError::Unavailable("connection reset".into()));
        }
        self.inner.manifests(repository).await
    }
}

#[tokio::test]
async fn enumeration_failure_records_partial_inventory() {
    let fixture = Fixture::new();
    let registry = memory_bucket("registry");
    let backups = memory_bucket("backups");
    fixture.seed(&registry).await;

    let catalog = Arc::new(Flaky {
        inner: (*fixture.catalog).clone(),
        broken: "api",
    });
    let err = Backup::new(catalog, registry, backups.clone(), options(2))
        .run("acme")
        .await
        .unwrap_err();

    match &err {
        BackupError::Aborted { number, stage, .. } => {
            assert_eq!(*number, 1);
            assert_eq!(*stage, Stage::Enumerate);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root(), BackupError::Catalog(_)));

    let inventories = InventoryManager::new(backups.clone());
    let stored = inventories.load("acme", 1).await.unwrap();
    assert_eq!(stored.summary.status, BackupStatus::Failed);
    assert_eq!(stored.repositories.len(), 1);
    assert!(stored.repository("web").is_some());
    assert_eq!(inventories.next("acme").await.unwrap(), 2);
    assert!(!LockManager::new(backups).is_locked("acme").await.unwrap());
}

#[tokio::test]
async fn path_like_namespace_is_rejected_before_locking() {
    let fixture = Fixture::new();
    let (registry_driver, registry) = counting_bucket("registry");
    let (backup_driver, backups) = counting_bucket("backups");

    for name in ["../acme", "acme/backup", ""] {
        let err = Backup::new(
            fixture.catalog.clone(),
            registry.clone(),
            backups.clone(),
            options(1),
        )
        .run(name)
        .await
        .unwrap_err();
        assert!(
            matches!(err, BackupError::InvalidNamespace(ref ns) if ns == name),
            "{name:?}: {err}"
        );
    }
    assert_eq!(registry_driver.counts.total(), 0);
    assert_eq!(backup_driver.counts.total(), 0);
}
