//! Numbered, append-only backup inventories.
//!
//! Every backup attempt writes exactly one `{namespace}/backup/{N}.json`
//! record to the backup bucket and never touches it again. The JSON shape is
//! the one earlier tooling wrote, so older inventories keep loading:
//!
//! ```json
//! {
//!   "User": "acme",
//!   "Id": "17",
//!   "Repositories": [
//!     { "Name": "web", "Id": "4", "Manifests": { "<digest>": ["<blob>", "..."] } }
//!   ],
//!   "Summary": {
//!     "Completed": "Monday, Oct 19, 2026 12:00",
//!     "Status": "Success",
//!     "RepositoriesCreated": "1",
//!     "ManifestsCreated": "1",
//!     "Data": { "Blobs": "2", "BytesWritten": "1024" }
//!   }
//! }
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use storage::{StorageBucket, StorageError, StorageErrorKind};

use crate::error::{BackupError, BackupResult};
use crate::layout::NamespaceKeys;
use crate::model::{Digest, Namespace};

/// Timestamp format of [`Summary::completed`].
const COMPLETED_FORMAT: &str = "%A, %b %d, %Y %H:%M";

/// Outcome recorded for a backup attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "String")]
pub enum BackupStatus {
    /// Every blob was copied.
    Success,

    /// Some blobs failed, or the run was aborted.
    Failed,

    /// Missing or unrecognized status.
    #[default]
    Unknown,
}

impl BackupStatus {
    /// Whether restores may use this inventory.
    pub fn is_success(&self) -> bool {
        matches!(self, BackupStatus::Success)
    }
}

/// Anything but the strings `Success` and `Failed` reads as `Unknown`,
/// including `null` and non-string values.
impl From<serde_json::Value> for BackupStatus {
    fn from(value: serde_json::Value) -> Self {
        match value.as_str() {
            Some("Success") => BackupStatus::Success,
            Some("Failed") => BackupStatus::Failed,
            _ => BackupStatus::Unknown,
        }
    }
}

impl From<BackupStatus> for String {
    fn from(value: BackupStatus) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::Success => f.write_str("Success"),
            BackupStatus::Failed => f.write_str("Failed"),
            BackupStatus::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Byte and blob totals of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSummary {
    /// Blobs written.
    #[serde(default, with = "count")]
    pub blobs: u64,

    /// Bytes written.
    #[serde(default, with = "count")]
    pub bytes_written: u64,
}

/// The summary block of an inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Summary {
    /// Completion time, human readable.
    #[serde(default)]
    pub completed: String,

    /// Outcome.
    #[serde(default)]
    pub status: BackupStatus,

    /// Repositories recorded.
    #[serde(default, with = "count")]
    pub repositories_created: u64,

    /// Manifests recorded.
    #[serde(default, with = "count")]
    pub manifests_created: u64,

    /// Totals.
    #[serde(default)]
    pub data: DataSummary,
}

impl Summary {
    /// A summary completed now.
    pub fn now(status: BackupStatus) -> Self {
        Self {
            completed: completed_now(),
            status,
            ..Default::default()
        }
    }
}

/// The current local time in the inventory timestamp format.
pub fn completed_now() -> String {
    chrono::Local::now().format(COMPLETED_FORMAT).to_string()
}

/// A manifest and the blobs it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Manifest digest.
    pub digest: Digest,

    /// Referenced blobs, child manifests flattened in.
    pub blobs: Vec<Digest>,
}

/// A repository as recorded in an inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepositoryEntry {
    /// Repository name.
    pub name: String,

    /// Catalog identifier.
    #[serde(default, with = "text")]
    pub id: String,

    /// Manifests, in enumeration order.
    #[serde(default, with = "manifests")]
    pub manifests: Vec<ManifestEntry>,
}

impl RepositoryEntry {
    /// Every blob reachable from this repository, without duplicates.
    pub fn blobs(&self) -> impl Iterator<Item = &Digest> {
        let mut seen = HashSet::new();
        self.manifests
            .iter()
            .flat_map(|manifest| manifest.blobs.iter())
            .filter(move |digest| seen.insert(*digest))
    }
}

/// One backup of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InventoryRecord {
    /// Backup number, taken from the object key rather than the payload.
    #[serde(skip)]
    pub backup_number: u64,

    /// Namespace name.
    #[serde(rename = "User", default)]
    pub namespace_name: String,

    /// Namespace catalog identifier.
    #[serde(rename = "Id", default, with = "text")]
    pub namespace_id: String,

    /// Repositories, in enumeration order.
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,

    /// Outcome and totals.
    #[serde(default)]
    pub summary: Summary,
}

impl InventoryRecord {
    /// A record for backup `number` of `namespace`.
    pub fn new(
        namespace: &Namespace,
        number: u64,
        repositories: Vec<RepositoryEntry>,
        summary: Summary,
    ) -> Self {
        Self {
            backup_number: number,
            namespace_name: namespace.name.clone(),
            namespace_id: namespace.id.clone(),
            repositories,
            summary,
        }
    }

    /// Every blob in the record, without duplicates, in first-seen order.
    pub fn blobs(&self) -> Vec<&Digest> {
        let mut seen = HashSet::new();
        self.repositories
            .iter()
            .flat_map(|repository| repository.manifests.iter())
            .flat_map(|manifest| manifest.blobs.iter())
            .filter(|digest| seen.insert(*digest))
            .collect()
    }

    /// Find a repository by name.
    pub fn repository(&self, name: &str) -> Option<&RepositoryEntry> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Total number of manifests.
    pub fn manifest_count(&self) -> usize {
        self.repositories.iter().map(|r| r.manifests.len()).sum()
    }
}

/// Lists, loads and writes inventories in the backup bucket.
#[derive(Debug, Clone)]
pub struct InventoryManager {
    bucket: StorageBucket,
}

impl InventoryManager {
    /// Manage inventories stored in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// Backup numbers recorded for `namespace`, ascending.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list(&self, namespace: &str) -> BackupResult<BTreeSet<u64>> {
        let keys = NamespaceKeys::new(namespace);
        let numbers: BTreeSet<u64> = self
            .bucket
            .list(Some(&keys.backups()))
            .await?
            .iter()
            .filter_map(|key| keys.parse_inventory(key))
            .collect();
        tracing::debug!("Found {} inventories", numbers.len());
        Ok(numbers)
    }

    /// The newest backup number, if any.
    pub async fn latest(&self, namespace: &str) -> BackupResult<Option<u64>> {
        Ok(self.list(namespace).await?.last().copied())
    }

    /// The number the next backup will use.
    pub async fn next(&self, namespace: &str) -> BackupResult<u64> {
        Ok(self.latest(namespace).await?.map_or(1, |n| n + 1))
    }

    /// Load backup `number`.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, namespace: &str, number: u64) -> BackupResult<InventoryRecord> {
        let key = NamespaceKeys::new(namespace).inventory(number);
        let body = match self.bucket.get_bytes(&key).await {
            Ok(body) => body,
            Err(error) if error.is_not_found() => {
                return Err(BackupError::BackupNotFound {
                    namespace: namespace.to_owned(),
                    number: Some(number),
                })
            }
            Err(error) => return Err(error.into()),
        };

        let mut record: InventoryRecord =
            serde_json::from_slice(&body).map_err(|source| BackupError::CorruptInventory {
                namespace: namespace.to_owned(),
                number,
                source,
            })?;
        record.backup_number = number;
        Ok(record)
    }

    /// Load `explicit`, or the newest inventory.
    pub async fn resolve(
        &self,
        namespace: &str,
        explicit: Option<u64>,
    ) -> BackupResult<InventoryRecord> {
        let number = match explicit {
            Some(number) => number,
            None => self
                .latest(namespace)
                .await?
                .ok_or_else(|| BackupError::BackupNotFound {
                    namespace: namespace.to_owned(),
                    number: None,
                })?,
        };
        self.load(namespace, number).await
    }

    /// Resolve an inventory that a restore may use: its status must be `Success`.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_for_restore(
        &self,
        namespace: &str,
        explicit: Option<u64>,
    ) -> BackupResult<InventoryRecord> {
        let record = self.resolve(namespace, explicit).await?;
        if !record.summary.status.is_success() {
            return Err(BackupError::ValidationFailed {
                number: record.backup_number,
                status: record.summary.status.clone(),
            });
        }
        Ok(record)
    }

    /// Resolve an inventory to verify against. Any status is accepted.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_for_verify(
        &self,
        namespace: &str,
        explicit: Option<u64>,
    ) -> BackupResult<InventoryRecord> {
        let record = self.resolve(namespace, explicit).await?;
        if !record.summary.status.is_success() {
            tracing::warn!(
                number = record.backup_number,
                status = %record.summary.status,
                "Verifying backup with status: {}",
                record.summary.status
            );
        }
        Ok(record)
    }

    /// Write `record` under its backup number. Never overwrites.
    #[tracing::instrument(skip(self, record), fields(number = record.backup_number))]
    pub async fn write(&self, namespace: &str, record: &InventoryRecord) -> BackupResult<()> {
        let key = NamespaceKeys::new(namespace).inventory(record.backup_number);
        let body = serde_json::to_vec_pretty(record)
            .map_err(StorageError::with("inventory", StorageErrorKind::SerializationError))?;

        match self.bucket.upload_new(&key, &mut body.as_slice()).await {
            Ok(()) => {
                tracing::info!(%key, status = %record.summary.status, "Wrote inventory");
                Ok(())
            }
            Err(error) if error.kind() == StorageErrorKind::AlreadyExists => {
                Err(BackupError::InventoryExists {
                    namespace: namespace.to_owned(),
                    number: record.backup_number,
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Counts are written as strings and read from strings or numbers.
mod count {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Lenient::deserialize(deserializer)? {
            Lenient::Number(n) => Ok(n),
            Lenient::Text(text) if text.trim().is_empty() => Ok(0),
            Lenient::Text(text) => text.trim().parse().map_err(de::Error::custom),
        }
    }
}

/// Identifiers are strings, but older records may carry numbers.
mod text {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(i64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<String, D::Error> {
        Ok(match Lenient::deserialize(deserializer)? {
            Lenient::Number(n) => n.to_string(),
            Lenient::Text(text) => text,
        })
    }
}

/// `Manifests` is a JSON object from manifest digest to blob digests, kept
/// in document order.
mod manifests {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::ManifestEntry;
    use crate::model::Digest;

    pub(super) fn serialize<S: Serializer>(
        value: &[ManifestEntry],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for manifest in value {
            map.serialize_entry(&manifest.digest, &manifest.blobs)?;
        }
        map.end()
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ManifestEntry>, D::Error> {
        deserializer.deserialize_map(ManifestVisitor)
    }

    struct ManifestVisitor;

    impl<'de> Visitor<'de> for ManifestVisitor {
        type Value = Vec<ManifestEntry>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of manifest digests to blob digests")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut manifests = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((digest, blobs)) = access.next_entry::<Digest, Vec<Digest>>()? {
                manifests.push(ManifestEntry { digest, blobs });
            }
            Ok(manifests)
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use storage::{MemoryStorage, Storage};

    use super::*;

    fn digest(s: &str) -> Digest {
        Digest::parse(s).unwrap()
    }

    fn manager() -> (StorageBucket, InventoryManager) {
        let bucket = Storage::new(MemoryStorage::new()).bucket("backups");
        (bucket.clone(), InventoryManager::new(bucket))
    }

    fn record(number: u64, status: BackupStatus) -> InventoryRecord {
        let namespace = Namespace {
            id: "17".into(),
            name: "acme".into(),
        };
        InventoryRecord::new(
            &namespace,
            number,
            vec![RepositoryEntry {
                name: "web".into(),
                id: "4".into(),
                manifests: vec![
                    ManifestEntry {
                        digest: digest("ff01"),
                        blobs: vec![digest("aa01"), digest("bb02")],
                    },
                    ManifestEntry {
                        digest: digest("ee02"),
                        blobs: vec![digest("bb02"), digest("cc03")],
                    },
                ],
            }],
            Summary::now(status),
        )
    }

    #[test]
    fn legacy_payload_parses() {
        let json = r#"{
            "User": "acme",
            "Id": 17,
            "Repositories": [
                {"Name": "web", "Id": 4, "Manifests": {
                    "sha256:ff01": ["sha256:aa01", "bb02"],
                    "ee02": []
                }}
            ],
            "Summary": {
                "Completed": "Friday, Jan 05, 2024 10:00",
                "Status": "Success",
                "RepositoriesCreated": "1",
                "ManifestsCreated": 2,
                "Data": {"Blobs": "2", "BytesWritten": "2048"}
            }
        }"#;

        let record: InventoryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.namespace_id, "17");
        assert_eq!(record.repositories[0].id, "4");
        assert_eq!(record.repositories[0].manifests[0].digest, digest("ff01"));
        assert_eq!(record.repositories[0].manifests[1].digest, digest("ee02"));
        assert_eq!(record.summary.status, BackupStatus::Success);
        assert_eq!(record.summary.manifests_created, 2);
        assert_eq!(record.summary.data.bytes_written, 2048);
    }

    #[test]
    fn counts_are_written_as_strings() {
        let mut record = record(1, BackupStatus::Success);
        record.summary.data.blobs = 3;
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["User"], "acme");
        assert_eq!(value["Summary"]["Data"]["Blobs"], "3");
        assert_eq!(value["Summary"]["Status"], "Success");
        assert!(value.get("backup_number").is_none());
        assert_eq!(
            value["Repositories"][0]["Manifests"]["ff01"],
            serde_json::json!(["aa01", "bb02"])
        );
    }

    #[test]
    fn missing_status_is_unknown() {
        let record: InventoryRecord = serde_json::from_str(r#"{"User": "acme"}"#).unwrap();
        assert_eq!(record.summary.status, BackupStatus::Unknown);

        let record: InventoryRecord =
            serde_json::from_str(r#"{"Summary": {"Status": "In Progress"}}"#).unwrap();
        assert_eq!(record.summary.status, BackupStatus::Unknown);
    }

    #[test]
    fn non_string_status_is_unknown() {
        for status in ["null", "1", "true", r#"{"State": "Success"}"#, r#"["Success"]"#] {
            let json = format!(r#"{{"User": "acme", "Summary": {{"Status": {status}}}}}"#);
            let record: InventoryRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(record.summary.status, BackupStatus::Unknown, "status {status}");
        }
    }

    #[test]
    fn blobs_are_deduplicated_in_order() {
        let record = record(1, BackupStatus::Success);
        let blobs: Vec<_> = record.blobs().into_iter().cloned().collect();
        assert_eq!(blobs, vec![digest("aa01"), digest("bb02"), digest("cc03")]);
        assert_eq!(record.repositories[0].blobs().count(), 3);
        assert_eq!(record.manifest_count(), 2);
    }

    #[tokio::test]
    async fn numbering_ignores_stray_keys() {
        let (bucket, inventories) = manager();
        assert_eq!(inventories.next("acme").await.unwrap(), 1);

        for key in [
            "acme/backup/1.json",
            "acme/backup/3.json",
            "acme/backup/lock",
            "acme/backup/0.json",
            "acme/backup/notes.json",
            "acme/backup/archive/9.json",
            "acme/blob/ab/abcd",
            "other/backup/7.json",
        ] {
            bucket.put_bytes(Utf8Path::new(key), b"{}").await.unwrap();
        }

        let numbers: Vec<u64> = inventories.list("acme").await.unwrap().into_iter().collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(inventories.next("acme").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn write_then_load() {
        let (_, inventories) = manager();
        let written = record(1, BackupStatus::Success);
        inventories.write("acme", &written).await.unwrap();

        let loaded = inventories.load("acme", 1).await.unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.backup_number, 1);

        let err = inventories.write("acme", &written).await.unwrap_err();
        assert!(matches!(err, BackupError::InventoryExists { number: 1, .. }));
    }

    #[tokio::test]
    async fn load_reports_missing_and_corrupt() {
        let (bucket, inventories) = manager();
        let err = inventories.load("acme", 2).await.unwrap_err();
        assert!(matches!(err, BackupError::BackupNotFound { number: Some(2), .. }));

        let err = inventories.resolve("acme", None).await.unwrap_err();
        assert!(matches!(err, BackupError::BackupNotFound { number: None, .. }));

        bucket
            .put_bytes(Utf8Path::new("acme/backup/2.json"), b"{ not json")
            .await
            .unwrap();
        let err = inventories.load("acme", 2).await.unwrap_err();
        assert!(matches!(err, BackupError::CorruptInventory { number: 2, .. }));
    }

    #[tokio::test]
    async fn restore_requires_success() {
        let (_, inventories) = manager();
        inventories
            .write("acme", &record(1, BackupStatus::Success))
            .await
            .unwrap();
        inventories
            .write("acme", &record(2, BackupStatus::Failed))
            .await
            .unwrap();

        let err = inventories.resolve_for_restore("acme", None).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ValidationFailed {
                number: 2,
                status: BackupStatus::Failed
            }
        ));

        let ok = inventories.resolve_for_restore("acme", Some(1)).await.unwrap();
        assert_eq!(ok.backup_number, 1);

        let verify = inventories.resolve_for_verify("acme", None).await.unwrap();
        assert_eq!(verify.backup_number, 2);
    }
}
