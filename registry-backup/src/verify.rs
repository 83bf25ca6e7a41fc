//! Checking a backup against the registry.
//!
//! A backup is complete when every blob the registry currently holds for the
//! namespace is recorded in the inventory. Blobs only the inventory knows
//! about (deleted since the backup) do not make it incomplete.

use std::collections::BTreeSet;
use std::fmt;

use storage::StorageBucket;

use crate::error::BackupResult;
use crate::inventory::{completed_now, BackupStatus, InventoryManager};
use crate::layout::{check_namespace, NamespaceKeys};
use crate::model::Digest;

/// How many missing digests a report lists.
const MISSING_EXAMPLES: usize = 10;

/// Verdict of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Every current blob is in the inventory.
    Complete,

    /// Some current blobs are not.
    Incomplete,
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyStatus::Complete => f.write_str("Complete"),
            VerifyStatus::Incomplete => f.write_str("Incomplete"),
        }
    }
}

/// Result of verifying one inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Namespace verified.
    pub namespace: String,

    /// When verification finished, human readable.
    pub completed: String,

    /// Inventory compared against.
    pub backup_number: u64,

    /// Status recorded in that inventory.
    pub inventory_status: BackupStatus,

    /// The verdict.
    pub status: VerifyStatus,

    /// Inventory repositories with at least one blob still in the registry.
    pub repositories_seen: usize,

    /// Inventory manifests with at least one blob still in the registry.
    pub manifests_seen: usize,

    /// Blobs currently in the registry.
    pub current_blobs: usize,

    /// Distinct blobs in the inventory.
    pub inventory_blobs: usize,

    /// Current blobs the inventory lacks.
    pub missing: usize,

    /// Up to ten of the missing digests, in order.
    pub missing_examples: Vec<Digest>,

    /// Of the missing blobs, how many the backup bucket holds anyway.
    pub missing_in_backup_storage: usize,

    /// Inventory blobs no longer in the registry.
    pub extra: usize,
}

/// Compares registry contents with a backup inventory.
#[derive(Debug, Clone)]
pub struct Verify {
    registry: StorageBucket,
    backups: StorageBucket,
    inventories: InventoryManager,
}

impl Verify {
    /// Verify the registry in `registry` against inventories in `backups`.
    pub fn new(registry: StorageBucket, backups: StorageBucket) -> Self {
        Self {
            inventories: InventoryManager::new(backups.clone()),
            registry,
            backups,
        }
    }

    /// Verify backup `from`, or the latest, of `namespace`.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, namespace: &str, from: Option<u64>) -> BackupResult<VerifyReport> {
        check_namespace(namespace)?;
        let record = self.inventories.resolve_for_verify(namespace, from).await?;
        let keys = NamespaceKeys::new(namespace);

        let current: BTreeSet<Digest> = self
            .registry
            .list(Some(&keys.blobs()))
            .await?
            .iter()
            .filter_map(|key| keys.parse_blob(key))
            .collect();
        let recorded: BTreeSet<&Digest> = record.blobs().into_iter().collect();

        let missing: Vec<&Digest> = current.iter().filter(|d| !recorded.contains(d)).collect();
        let extra = recorded.iter().filter(|d| !current.contains(**d)).count();

        let mut missing_in_backup_storage = 0;
        for digest in &missing {
            if self.backups.exists(&keys.blob(digest)).await? {
                missing_in_backup_storage += 1;
            }
        }

        let mut repositories_seen = 0;
        let mut manifests_seen = 0;
        for repository in &record.repositories {
            let seen = repository
                .manifests
                .iter()
                .filter(|manifest| manifest.blobs.iter().any(|blob| current.contains(blob)))
                .count();
            if seen > 0 {
                repositories_seen += 1;
            }
            manifests_seen += seen;
        }

        let status = if missing.is_empty() {
            VerifyStatus::Complete
        } else {
            VerifyStatus::Incomplete
        };
        tracing::info!(
            number = record.backup_number,
            %status,
            current = current.len(),
            missing = missing.len(),
            extra,
            "Verified backup"
        );

        Ok(VerifyReport {
            namespace: namespace.to_owned(),
            completed: completed_now(),
            backup_number: record.backup_number,
            inventory_status: record.summary.status.clone(),
            status,
            repositories_seen,
            manifests_seen,
            current_blobs: current.len(),
            inventory_blobs: recorded.len(),
            missing: missing.len(),
            missing_examples: missing
                .iter()
                .take(MISSING_EXAMPLES)
                .map(|d| (*d).clone())
                .collect(),
            missing_in_backup_storage,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::error::BackupError;
    use crate::inventory::{InventoryRecord, ManifestEntry, RepositoryEntry, Summary};
    use crate::model::Namespace;

    fn digest(s: &str) -> Digest {
        Digest::parse(s).unwrap()
    }

    async fn fixture(status: BackupStatus) -> (StorageBucket, StorageBucket) {
        let registry = Storage::new(MemoryStorage::new()).bucket("registry");
        let backups = Storage::new(MemoryStorage::new()).bucket("backups");
        let namespace = Namespace {
            id: "1".into(),
            name: "acme".into(),
        };
        let record = InventoryRecord::new(
            &namespace,
            1,
            vec![
                RepositoryEntry {
                    name: "web".into(),
                    id: "10".into(),
                    manifests: vec![ManifestEntry {
                        digest: digest("ff01"),
                        blobs: vec![digest("aa01"), digest("bb02")],
                    }],
                },
                RepositoryEntry {
                    name: "old".into(),
                    id: "11".into(),
                    manifests: vec![ManifestEntry {
                        digest: digest("ff02"),
                        blobs: vec![digest("dd04")],
                    }],
                },
            ],
            Summary::now(status),
        );
        InventoryManager::new(backups.clone())
            .write("acme", &record)
            .await
            .unwrap();
        (registry, backups)
    }

    async fn put(bucket: &StorageBucket, key: &str) {
        bucket.put_bytes(Utf8Path::new(key), b"x").await.unwrap();
    }

    #[tokio::test]
    async fn subset_is_complete() {
        let (registry, backups) = fixture(BackupStatus::Success).await;
        put(&registry, "acme/blob/aa/aa01").await;
        put(&registry, "acme/blob/bb/bb02").await;
        put(&registry, "acme/blob/stray").await;

        let report = Verify::new(registry, backups).run("acme", None).await.unwrap();
        assert_eq!(report.status, VerifyStatus::Complete);
        assert_eq!(report.current_blobs, 2);
        assert_eq!(report.extra, 1);
        assert_eq!(report.repositories_seen, 1);
        assert_eq!(report.manifests_seen, 1);
    }

    #[tokio::test]
    async fn new_blobs_make_it_incomplete() {
        let (registry, backups) = fixture(BackupStatus::Failed).await;
        put(&registry, "acme/blob/aa/aa01").await;
        put(&registry, "acme/blob/ee/ee05").await;
        put(&registry, "acme/blob/ff/ff06").await;
        put(&backups, "acme/blob/ff/ff06").await;

        let report = Verify::new(registry, backups).run("acme", Some(1)).await.unwrap();
        assert_eq!(report.status, VerifyStatus::Incomplete);
        assert_eq!(report.inventory_status, BackupStatus::Failed);
        assert_eq!(report.missing, 2);
        assert_eq!(report.missing_examples, vec![digest("ee05"), digest("ff06")]);
        assert_eq!(report.missing_in_backup_storage, 1);
    }

    #[tokio::test]
    async fn without_inventory_fails() {
        let registry = Storage::new(MemoryStorage::new()).bucket("registry");
        let backups = Storage::new(MemoryStorage::new()).bucket("backups");
        let err = Verify::new(registry, backups).run("acme", None).await.unwrap_err();
        assert!(matches!(err, BackupError::BackupNotFound { number: None, .. }));
    }
}
