//! Read access to the registry database.
//!
//! Backups enumerate a namespace through the [`Catalog`] trait. The crate
//! ships [`MemoryCatalog`], which serves a JSON snapshot of the database:
//!
//! ```json
//! {
//!   "namespaces": [{
//!     "id": "17",
//!     "name": "acme",
//!     "repositories": [{
//!       "id": "4",
//!       "name": "web",
//!       "manifests": [
//!         { "digest": "sha256:aa..", "blobs": [{ "digest": "sha256:bb..", "size": 1024 }] },
//!         { "digest": "sha256:cc..", "children": ["sha256:aa.."] }
//!       ]
//!     }]
//!   }]
//! }
//! ```
//!
//! Manifest lists name their children by digest; [`Catalog::manifests`]
//! returns them with the children's blobs flattened in.

use std::collections::HashSet;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::model::{BlobRef, Digest, ManifestBlobs, Namespace, RepositoryRef};

/// Errors reading the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The snapshot file could not be read.
    #[error("reading catalog snapshot {path}")]
    Io {
        /// Snapshot path.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot is not valid.
    #[error("parsing catalog snapshot")]
    Parse(#[from] serde_json::Error),

    /// The catalog has no such repository.
    #[error("repository {0} not found in catalog")]
    RepositoryNotFound(String),

    /// The backing database failed.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read contract of the registry database, as used by backups.
#[async_trait::async_trait]
pub trait Catalog: fmt::Debug + Send + Sync {
    /// Look up a namespace by name.
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, CatalogError>;

    /// The repositories of a namespace, in a stable order.
    async fn repositories(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<RepositoryRef>, CatalogError>;

    /// The manifests of a repository with their blobs, child manifests flattened.
    async fn manifests(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Vec<ManifestBlobs>, CatalogError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    namespaces: Vec<NamespaceSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamespaceSnapshot {
    id: String,
    name: String,
    #[serde(default)]
    repositories: Vec<RepositorySnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepositorySnapshot {
    id: String,
    name: String,
    #[serde(default)]
    manifests: Vec<ManifestSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestSnapshot {
    digest: Digest,
    #[serde(default)]
    blobs: Vec<BlobSnapshot>,
    #[serde(default)]
    children: Vec<Digest>,
}

#[derive(Debug, Clone, Deserialize)]
struct BlobSnapshot {
    digest: Digest,
    #[serde(default)]
    size: Option<u64>,
    /// Blobs still being pushed are not part of the namespace yet.
    #[serde(default)]
    uploading: bool,
}

/// A catalog held in memory, built in code or loaded from a JSON snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    snapshot: Snapshot,
}

impl MemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON snapshot.
    pub fn from_json(data: &[u8]) -> Result<Self, CatalogError> {
        Ok(Self {
            snapshot: serde_json::from_slice(data)?,
        })
    }

    /// Load a JSON snapshot from disk.
    pub async fn from_file(path: &Utf8Path) -> Result<Self, CatalogError> {
        let data = tokio::fs::read(path).await.map_err(|source| CatalogError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&data)
    }

    /// Add a namespace.
    pub fn with_namespace(mut self, id: &str, name: &str) -> Self {
        self.snapshot.namespaces.push(NamespaceSnapshot {
            id: id.to_owned(),
            name: name.to_owned(),
            repositories: Vec::new(),
        });
        self
    }

    /// Add a repository to the most recently added namespace.
    pub fn with_repository(mut self, id: &str, name: &str) -> Self {
        if let Some(namespace) = self.snapshot.namespaces.last_mut() {
            namespace.repositories.push(RepositorySnapshot {
                id: id.to_owned(),
                name: name.to_owned(),
                manifests: Vec::new(),
            });
        }
        self
    }

    /// Add a manifest with sized blobs to the most recently added repository.
    pub fn with_manifest(mut self, digest: Digest, blobs: &[(Digest, u64)]) -> Self {
        if let Some(repository) = self.last_repository() {
            repository.manifests.push(ManifestSnapshot {
                digest,
                blobs: blobs
                    .iter()
                    .map(|(digest, size)| BlobSnapshot {
                        digest: digest.clone(),
                        size: Some(*size),
                        uploading: false,
                    })
                    .collect(),
                children: Vec::new(),
            });
        }
        self
    }

    /// Add a manifest list referencing `children` to the most recently added repository.
    pub fn with_manifest_list(mut self, digest: Digest, children: &[Digest]) -> Self {
        if let Some(repository) = self.last_repository() {
            repository.manifests.push(ManifestSnapshot {
                digest,
                blobs: Vec::new(),
                children: children.to_vec(),
            });
        }
        self
    }

    fn last_repository(&mut self) -> Option<&mut RepositorySnapshot> {
        self.snapshot
            .namespaces
            .last_mut()
            .and_then(|namespace| namespace.repositories.last_mut())
    }

    fn find_repository(&self, repository: &RepositoryRef) -> Option<&RepositorySnapshot> {
        self.snapshot
            .namespaces
            .iter()
            .flat_map(|namespace| namespace.repositories.iter())
            .find(|candidate| candidate.id == repository.id)
    }
}

fn flatten(repository: &RepositorySnapshot, manifest: &ManifestSnapshot) -> ManifestBlobs {
    let mut seen = HashSet::new();
    let mut blobs = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![manifest];

    while let Some(current) = pending.pop() {
        if !visited.insert(&current.digest) {
            continue;
        }

        for blob in current.blobs.iter().filter(|blob| !blob.uploading) {
            if seen.insert(blob.digest.clone()) {
                blobs.push(BlobRef {
                    digest: blob.digest.clone(),
                    size: blob.size,
                });
            }
        }

        for child in current.children.iter().rev() {
            match repository.manifests.iter().find(|m| &m.digest == child) {
                Some(found) => pending.push(found),
                None => tracing::warn!(
                    repository = %repository.name,
                    manifest = %current.digest,
                    %child,
                    "Child manifest not in catalog"
                ),
            }
        }
    }

    ManifestBlobs {
        digest: manifest.digest.clone(),
        blobs,
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, CatalogError> {
        Ok(self
            .snapshot
            .namespaces
            .iter()
            .find(|namespace| namespace.name == name)
            .map(|namespace| Namespace {
                id: namespace.id.clone(),
                name: namespace.name.clone(),
            }))
    }

    async fn repositories(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<RepositoryRef>, CatalogError> {
        Ok(self
            .snapshot
            .namespaces
            .iter()
            .filter(|candidate| candidate.id == namespace.id)
            .flat_map(|candidate| candidate.repositories.iter())
            .map(|repository| RepositoryRef {
                id: repository.id.clone(),
                name: repository.name.clone(),
            })
            .collect())
    }

    async fn manifests(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Vec<ManifestBlobs>, CatalogError> {
        let found = self
            .find_repository(repository)
            .ok_or_else(|| CatalogError::RepositoryNotFound(repository.name.clone()))?;
        Ok(found
            .manifests
            .iter()
            .map(|manifest| flatten(found, manifest))
            .collect())
    }
}
