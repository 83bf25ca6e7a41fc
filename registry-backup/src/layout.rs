//! Object keys for one namespace.
//!
//! Both the registry storage and the backup storage use the same layout:
//!
//! ```text
//! {namespace}/backup/lock
//! {namespace}/backup/{N}.json
//! {namespace}/blob/{digest[0:2]}/{digest}
//! ```

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BackupError, BackupResult};
use crate::model::Digest;

const BACKUP_DIR: &str = "backup";
const BLOB_DIR: &str = "blob";
const LOCK_FILE: &str = "lock";
const INVENTORY_EXTENSION: &str = "json";

/// Reject namespace names that would not stay a single key component:
/// empty names, `.`, anything containing `..`, and path separators.
pub fn check_namespace(name: &str) -> BackupResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(BackupError::InvalidNamespace(name.to_owned()));
    }
    Ok(())
}

/// Key builder for a namespace.
///
/// Names are used as given; callers check them with [`check_namespace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceKeys {
    prefix: Utf8PathBuf,
}

impl NamespaceKeys {
    /// Keys under the namespace `name`.
    pub fn new(name: &str) -> Self {
        Self {
            prefix: Utf8PathBuf::from(name),
        }
    }

    /// The lock marker.
    pub fn lock(&self) -> Utf8PathBuf {
        self.backups().join(LOCK_FILE)
    }

    /// The directory holding lock and inventories.
    pub fn backups(&self) -> Utf8PathBuf {
        self.prefix.join(BACKUP_DIR)
    }

    /// The inventory for backup `number`.
    pub fn inventory(&self, number: u64) -> Utf8PathBuf {
        self.backups()
            .join(format!("{number}.{INVENTORY_EXTENSION}"))
    }

    /// The directory holding all blobs.
    pub fn blobs(&self) -> Utf8PathBuf {
        self.prefix.join(BLOB_DIR)
    }

    /// The key for one blob.
    pub fn blob(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.blobs();
        path.push(digest.shard());
        path.push(digest.as_str());
        path
    }

    /// Parse a backup number from a key listed under [`NamespaceKeys::backups`].
    ///
    /// Only `N.json` directly under the backup directory with `N >= 1` is accepted.
    pub fn parse_inventory(&self, key: &str) -> Option<u64> {
        let rest = Utf8Path::new(key).strip_prefix(self.backups()).ok()?;
        let mut components = rest.components();
        let name = components.next()?.as_str();
        if components.next().is_some() {
            return None;
        }

        let stem = name.strip_suffix(INVENTORY_EXTENSION)?.strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().filter(|n| *n > 0)
    }

    /// Parse a digest from a key listed under [`NamespaceKeys::blobs`].
    ///
    /// The key must be `{shard}/{digest}` below the blob directory, with the
    /// shard matching the digest.
    pub fn parse_blob(&self, key: &str) -> Option<Digest> {
        let rest = Utf8Path::new(key).strip_prefix(self.blobs()).ok()?;
        let mut components = rest.components();
        let shard = components.next()?.as_str();
        let name = components.next()?.as_str();
        if components.next().is_some() {
            return None;
        }

        let digest = Digest::parse(name).ok()?;
        (digest.shard() == shard).then_some(digest)
    }
}
