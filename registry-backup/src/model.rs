//! Identifiers shared by the catalog, inventories and the transfer engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix carried by digests in manifests and in the registry database.
const ALGORITHM_PREFIX: &str = "sha256:";

/// The content hash of a blob, held as bare lowercase hex.
///
/// Parsing accepts the `sha256:` prefixed form and strips it, so digests
/// coming from the catalog and from older inventories compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

/// A string that cannot be used as a [`Digest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest: {0:?}")]
pub struct InvalidDigest(String);

impl Digest {
    /// Parse a digest, with or without its algorithm prefix.
    pub fn parse(value: &str) -> Result<Self, InvalidDigest> {
        let hex = value.strip_prefix(ALGORITHM_PREFIX).unwrap_or(value);
        if hex.len() < 2 || !hex.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidDigest(value.to_owned()));
        }
        Ok(Digest(hex.to_ascii_lowercase()))
    }

    /// The bare hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two character shard used in blob keys.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Whether `data` hashes to this digest.
    pub fn matches(&self, hash: &[u8]) -> bool {
        hex::encode(hash) == self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A registry namespace (organization or user), resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Catalog identifier.
    pub id: String,

    /// Name; also the key prefix in both storages.
    pub name: String,
}

/// A repository inside a namespace, as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Catalog identifier.
    pub id: String,

    /// Repository name.
    pub name: String,
}

/// A blob referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Content digest.
    pub digest: Digest,

    /// Size in bytes, when the catalog records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A manifest and every blob it reaches, child manifests included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestBlobs {
    /// Manifest digest.
    pub digest: Digest,

    /// Referenced blobs, without duplicates, in first-seen order.
    pub blobs: Vec<BlobRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_algorithm() {
        let bare = Digest::parse("ABCDEF0123").unwrap();
        let prefixed: Digest = "sha256:abcdef0123".parse().unwrap();
        assert_eq!(bare, prefixed);
        assert_eq!(prefixed.as_str(), "abcdef0123");
        assert_eq!(prefixed.shard(), "ab");
    }

    #[test]
    fn parse_rejects_unusable_keys() {
        assert!(Digest::parse("a").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("ab/../cd").is_err());
        assert!(Digest::parse("").is_err());
    }

    #[test]
    fn serde_uses_bare_hex() {
        let digest: Digest = serde_json::from_str(r#""sha256:beef""#).unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), r#""beef""#);
        assert!(serde_json::from_str::<Digest>(r#""x""#).is_err());
    }

    #[test]
    fn matches_hex_hash() {
        use sha2::{Digest as _, Sha256};

        let hash = Sha256::digest(b"layer");
        let digest = Digest::parse(&hex::encode(hash)).unwrap();
        assert!(digest.matches(&hash));
        assert!(!Digest::parse("00").unwrap().matches(&hash));
    }
}
