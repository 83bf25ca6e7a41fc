//! Backing up a namespace.
//!
//! A run takes the namespace lock, picks the next backup number, enumerates
//! the namespace from the catalog, copies every blob from the registry
//! bucket into the backup bucket, and writes the inventory. The lock is
//! released on every path once it was taken.

use std::collections::HashSet;
use std::sync::Arc;

use storage::StorageBucket;

use crate::catalog::Catalog;
use crate::error::{BackupError, BackupResult, Stage};
use crate::inventory::{
    BackupStatus, DataSummary, InventoryManager, InventoryRecord, ManifestEntry, RepositoryEntry,
    Summary,
};
use crate::layout::{check_namespace, NamespaceKeys};
use crate::lock::LockManager;
use crate::model::{Digest, Namespace};
use crate::transfer::{TransferEngine, TransferOptions, TransferReport, TransferTask};

/// Options for a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Transfer workers.
    pub workers: usize,

    /// Copy blobs even when the backup bucket already has them.
    pub force_blobs: bool,

    /// Hash blobs while copying.
    pub verify_digests: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            force_blobs: false,
            verify_digests: false,
        }
    }
}

/// A finished backup. Per-blob failures show up in `report` and make the
/// recorded status `Failed`.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// The namespace backed up.
    pub namespace: Namespace,

    /// The number written.
    pub backup_number: u64,

    /// The inventory written.
    pub record: InventoryRecord,

    /// Transfer totals.
    pub report: TransferReport,
}

/// What enumeration has produced so far.
#[derive(Debug, Default)]
struct Enumeration {
    repositories: Vec<RepositoryEntry>,
    tasks: Vec<TransferTask>,
    seen: HashSet<Digest>,
}

impl Enumeration {
    fn summary(&self, status: BackupStatus, report: Option<&TransferReport>) -> Summary {
        Summary {
            repositories_created: self.repositories.len() as u64,
            manifests_created: self
                .repositories
                .iter()
                .map(|r| r.manifests.len() as u64)
                .sum(),
            data: DataSummary {
                blobs: report.map_or(0, |r| r.transferred as u64),
                bytes_written: report.map_or(0, |r| r.bytes),
            },
            ..Summary::now(status)
        }
    }
}

/// Backs up namespaces from a registry bucket into a backup bucket.
#[derive(Debug, Clone)]
pub struct Backup {
    catalog: Arc<dyn Catalog>,
    registry: StorageBucket,
    backups: StorageBucket,
    locks: LockManager,
    inventories: InventoryManager,
    options: BackupOptions,
}

impl Backup {
    /// A backup from `registry` into `backups`, enumerating through `catalog`.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        registry: StorageBucket,
        backups: StorageBucket,
        options: BackupOptions,
    ) -> Self {
        Self {
            catalog,
            locks: LockManager::new(backups.clone()),
            inventories: InventoryManager::new(backups.clone()),
            registry,
            backups,
            options,
        }
    }

    /// Back up `namespace`.
    #[tracing::instrument(skip(self), fields(bucket = self.backups.name()))]
    pub async fn run(&self, namespace: &str) -> BackupResult<BackupOutcome> {
        check_namespace(namespace)?;
        self.locks.try_acquire(namespace).await?;

        let result = self.locked(namespace).await;

        match self.locks.release(namespace).await {
            Ok(()) => result,
            Err(error) if result.is_ok() => Err(error),
            Err(error) => {
                tracing::error!(%error, "Could not release lock after failed backup");
                result
            }
        }
    }

    async fn locked(&self, name: &str) -> BackupResult<BackupOutcome> {
        let namespace = self
            .catalog
            .namespace(name)
            .await?
            .ok_or_else(|| BackupError::NamespaceNotFound(name.to_owned()))?;
        let number = self.inventories.next(name).await?;
        tracing::info!(number, namespace = %namespace.name, "Starting backup");

        let mut enumeration = Enumeration::default();
        if let Err(error) = self.enumerate(&namespace, &mut enumeration).await {
            return Err(self
                .abort(&namespace, number, Stage::Enumerate, enumeration, error)
                .await);
        }
        tracing::info!(
            repositories = enumeration.repositories.len(),
            blobs = enumeration.tasks.len(),
            "Enumerated namespace"
        );

        let engine = TransferEngine::new(
            self.registry.clone(),
            self.backups.clone(),
            TransferOptions {
                workers: self.options.workers,
                force: self.options.force_blobs,
                dry_run: false,
                verify_digests: self.options.verify_digests,
            },
        );
        let report = match engine.run(std::mem::take(&mut enumeration.tasks)).await {
            Ok(report) => report,
            Err(error) => {
                return Err(self
                    .abort(&namespace, number, Stage::Transfer, enumeration, error)
                    .await)
            }
        };

        let status = if report.is_success() {
            BackupStatus::Success
        } else {
            BackupStatus::Failed
        };
        let summary = enumeration.summary(status, Some(&report));
        let record = InventoryRecord::new(&namespace, number, enumeration.repositories, summary);

        if let Err(error) = self.inventories.write(name, &record).await {
            return Err(BackupError::Aborted {
                number,
                stage: Stage::WriteInventory,
                source: Box::new(error),
            });
        }

        Ok(BackupOutcome {
            namespace,
            backup_number: number,
            record,
            report,
        })
    }

    async fn enumerate(
        &self,
        namespace: &Namespace,
        enumeration: &mut Enumeration,
    ) -> BackupResult<()> {
        let keys = NamespaceKeys::new(&namespace.name);

        for repository in self.catalog.repositories(namespace).await? {
            let manifests = self.catalog.manifests(&repository).await?;
            tracing::debug!(
                repository = %repository.name,
                manifests = manifests.len(),
                "Enumerated repository"
            );

            let mut entry = RepositoryEntry {
                name: repository.name,
                id: repository.id,
                manifests: Vec::with_capacity(manifests.len()),
            };
            for manifest in manifests {
                let mut blobs = Vec::with_capacity(manifest.blobs.len());
                for blob in manifest.blobs {
                    if enumeration.seen.insert(blob.digest.clone()) {
                        enumeration
                            .tasks
                            .push(TransferTask::blob(&keys, blob.digest.clone(), blob.size));
                    }
                    blobs.push(blob.digest);
                }
                entry.manifests.push(ManifestEntry {
                    digest: manifest.digest,
                    blobs,
                });
            }
            enumeration.repositories.push(entry);
        }

        Ok(())
    }

    /// Record a `Failed` inventory for an interrupted run, then wrap `error`.
    async fn abort(
        &self,
        namespace: &Namespace,
        number: u64,
        stage: Stage,
        enumeration: Enumeration,
        error: BackupError,
    ) -> BackupError {
        tracing::error!(number, %stage, %error, "Backup aborted");

        let summary = enumeration.summary(BackupStatus::Failed, None);
        let record = InventoryRecord::new(namespace, number, enumeration.repositories, summary);
        if let Err(write_error) = self.inventories.write(&namespace.name, &record).await {
            tracing::error!(number, error = %write_error, "Could not record failed backup");
        }

        BackupError::Aborted {
            number,
            stage,
            source: Box::new(error),
        }
    }
}
