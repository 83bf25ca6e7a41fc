//! Restoring a namespace from a backup.
//!
//! A restore copies the blobs recorded in one inventory from the backup
//! bucket back into the registry bucket. Blobs the registry already has are
//! skipped, so an interrupted restore can simply be run again.

use std::collections::HashSet;

use storage::StorageBucket;

use crate::error::{BackupError, BackupResult};
use crate::inventory::{
    completed_now, BackupStatus, DataSummary, InventoryManager, InventoryRecord, RepositoryEntry,
    Summary,
};
use crate::layout::{check_namespace, NamespaceKeys};
use crate::lock::LockManager;
use crate::transfer::{
    FailedTransfer, TransferEngine, TransferOptions, TransferReport, TransferTask,
};

/// Options for a restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Transfer workers.
    pub workers: usize,

    /// Copy blobs even when the registry already has them.
    pub force_blobs: bool,

    /// Report what would be copied without writing.
    pub dry_run: bool,

    /// Hash blobs while copying.
    pub verify_digests: bool,

    /// Restore a single repository.
    pub repository: Option<String>,

    /// Restore this backup instead of the latest.
    pub from: Option<u64>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            force_blobs: false,
            dry_run: false,
            verify_digests: false,
            repository: None,
            from: None,
        }
    }
}

/// The blobs a restore will copy.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// The inventory restored from.
    pub record: InventoryRecord,

    /// Repositories selected.
    pub repositories: usize,

    /// Manifests selected.
    pub manifests: usize,

    /// One task per distinct blob, in inventory order.
    pub tasks: Vec<TransferTask>,
}

/// Result of a dry run.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    /// Namespace recorded in the inventory.
    pub namespace: String,

    /// Backup number planned from.
    pub backup_number: u64,

    /// Repository filter, if any.
    pub repository: Option<String>,

    /// Repositories that would be restored.
    pub repositories_to_restore: usize,

    /// Manifests that would be restored.
    pub manifests_to_restore: usize,

    /// Distinct blobs selected.
    pub total_blobs: usize,

    /// Blobs the registry already has.
    pub existing_blobs: usize,

    /// Blobs that would be copied.
    pub blobs_to_download: usize,

    /// Blobs whose state could not be checked.
    pub failed: Vec<FailedTransfer>,

    /// The planned digests, in order.
    pub tasks: Vec<TransferTask>,
}

impl DryRunReport {
    /// Human readable summary lines.
    pub fn actions(&self) -> Vec<String> {
        let mut actions = vec![
            format!("Would restore {} blobs from backup", self.blobs_to_download),
            format!("Would skip {} existing blobs", self.existing_blobs),
            format!("Would process {} total blobs", self.total_blobs),
        ];
        if !self.failed.is_empty() {
            actions.push(format!("Could not check {} blobs", self.failed.len()));
        }
        actions
    }
}

/// Result of a restore that copied blobs.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Namespace restored.
    pub namespace: String,

    /// Backup number restored from.
    pub backup_number: u64,

    /// Repository filter, if any.
    pub repository: Option<String>,

    /// Totals in the inventory summary format. Not persisted.
    pub summary: Summary,

    /// Transfer totals.
    pub report: TransferReport,
}

/// What a restore run produced.
#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// Nothing was written.
    DryRun(DryRunReport),

    /// Blobs were copied.
    Restored(RestoreReport),
}

/// Restores namespaces from a backup bucket into a registry bucket.
#[derive(Debug, Clone)]
pub struct Restore {
    registry: StorageBucket,
    backups: StorageBucket,
    locks: LockManager,
    inventories: InventoryManager,
    options: RestoreOptions,
}

impl Restore {
    /// A restore from `backups` into `registry`.
    pub fn new(registry: StorageBucket, backups: StorageBucket, options: RestoreOptions) -> Self {
        Self {
            locks: LockManager::new(backups.clone()),
            inventories: InventoryManager::new(backups.clone()),
            registry,
            backups,
            options,
        }
    }

    /// Select the inventory and build the task list, without touching the registry.
    #[tracing::instrument(
        skip(self),
        fields(from = ?self.options.from, repository = ?self.options.repository)
    )]
    pub async fn plan(&self, namespace: &str) -> BackupResult<RestorePlan> {
        check_namespace(namespace)?;
        if self.locks.is_locked(namespace).await? {
            return Err(BackupError::LockHeld(namespace.to_owned()));
        }

        let record = self
            .inventories
            .resolve_for_restore(namespace, self.options.from)
            .await?;
        if record.namespace_name != namespace {
            tracing::warn!(
                recorded = %record.namespace_name,
                requested = %namespace,
                "Inventory was recorded for a different namespace"
            );
        }

        let selected: Vec<&RepositoryEntry> = match &self.options.repository {
            Some(name) => {
                let repository = record.repository(name).ok_or_else(|| {
                    BackupError::RepositoryNotInBackup {
                        repository: name.clone(),
                        number: record.backup_number,
                    }
                })?;
                vec![repository]
            }
            None => record.repositories.iter().collect(),
        };

        let keys = NamespaceKeys::new(namespace);
        let mut seen = HashSet::new();
        let tasks: Vec<TransferTask> = selected
            .iter()
            .flat_map(|repository| repository.blobs())
            .filter(|digest| seen.insert(*digest))
            .map(|digest| TransferTask::blob(&keys, digest.clone(), None))
            .collect();

        let repositories = selected.len();
        let manifests = selected.iter().map(|r| r.manifests.len()).sum();
        tracing::info!(
            number = record.backup_number,
            repositories,
            manifests,
            blobs = tasks.len(),
            "Planned restore"
        );

        Ok(RestorePlan {
            record,
            repositories,
            manifests,
            tasks,
        })
    }

    /// Restore `namespace`, or report what would be restored on a dry run.
    #[tracing::instrument(skip(self), fields(bucket = self.registry.name()))]
    pub async fn run(&self, namespace: &str) -> BackupResult<RestoreOutcome> {
        let plan = self.plan(namespace).await?;

        let engine = TransferEngine::new(
            self.backups.clone(),
            self.registry.clone(),
            TransferOptions {
                workers: self.options.workers,
                force: self.options.force_blobs,
                dry_run: self.options.dry_run,
                verify_digests: self.options.verify_digests,
            },
        );
        let report = engine.run(plan.tasks.clone()).await?;

        if self.options.dry_run {
            return Ok(RestoreOutcome::DryRun(DryRunReport {
                namespace: plan.record.namespace_name,
                backup_number: plan.record.backup_number,
                repository: self.options.repository.clone(),
                repositories_to_restore: plan.repositories,
                manifests_to_restore: plan.manifests,
                total_blobs: plan.tasks.len(),
                existing_blobs: report.skipped,
                blobs_to_download: report.planned,
                failed: report.failed,
                tasks: plan.tasks,
            }));
        }

        let status = if report.is_success() {
            BackupStatus::Success
        } else {
            BackupStatus::Failed
        };
        let summary = Summary {
            completed: completed_now(),
            status,
            repositories_created: plan.repositories as u64,
            manifests_created: plan.manifests as u64,
            data: DataSummary {
                blobs: report.transferred as u64,
                bytes_written: report.bytes,
            },
        };

        Ok(RestoreOutcome::Restored(RestoreReport {
            namespace: namespace.to_owned(),
            backup_number: plan.record.backup_number,
            repository: self.options.repository.clone(),
            summary,
            report,
        }))
    }
}
