use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Marker for in-flight uploads, which are hidden from listings.
const PARTIAL_MARKER: &str = ".partial-";

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/<key>`. Uploads are written to a hidden
/// sibling file and renamed into place, so an interrupted upload never leaves
/// a truncated object at the key.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push(remote);
        path
    }

    fn error(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        context: &str,
        err: std::io::Error,
    ) -> StorageError {
        StorageError::io(self.name(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .context(context)
            .build()
    }

    async fn create_parent(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        path: &Utf8Path,
    ) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                "key has no parent",
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build()
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| self.error(bucket, remote, "create parent directories", err))
    }

    /// Write the upload to a hidden sibling of `path`, returning its location.
    /// The partial file is removed when the write fails.
    async fn write_partial(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        path: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<Utf8PathBuf, StorageError> {
        self.create_parent(bucket, remote, path).await?;

        let partial = partial_path(path);
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&partial)
                .await
                .map_err(|err| self.error(bucket, remote, "create partial file", err))?,
        );

        let written = async {
            tokio::io::copy(reader, &mut writer).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.error(bucket, remote, "write partial file", err));
        }

        Ok(partial)
    }
}

fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    let n = PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().unwrap_or("object");
    path.with_file_name(format!(".{name}{PARTIAL_MARKER}{}-{n}", std::process::id()))
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?;
        if !metadata.is_file() {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::NotFound,
                format!("not an object: {remote}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.error(bucket, remote, "timestamps", err))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(bucket, remote, "remove file", err))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        let partial = self.write_partial(bucket, remote, &path, reader).await?;

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|err| self.error(bucket, remote, "rename into place", err))
    }

    async fn upload_new(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        let partial = self.write_partial(bucket, remote, &path, reader).await?;

        // Linking fails when the key exists, so only one caller can win.
        let linked = tokio::fs::hard_link(&partial, &path).await;
        let _ = tokio::fs::remove_file(&partial).await;
        linked.map_err(|err| self.error(bucket, remote, "link into place", err))
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, "open file", err))?,
        );

        tokio::io::copy(&mut reader, writer)
            .await
            .map_err(|err| self.error(bucket, remote, "copy", err))?;

        writer
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, "flush writer", err))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(bucket);
        let start = match prefix {
            Some(prefix) => base.join(prefix),
            None => base.clone(),
        };

        let keys = tokio::task::spawn_blocking(move || collect_keys(&base, &start))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(self.name(), err).bucket(bucket).build())?;

        tracing::debug!("Found {} entries", keys.len());
        Ok(keys)
    }
}

#[tracing::instrument(level = "trace")]
fn collect_keys(base: &Utf8Path, start: &Utf8Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();

    match std::fs::metadata(start) {
        Ok(meta) if meta.is_dir() => visit(start, &mut files)?,
        Ok(_) => files.push(start.to_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut keys: Vec<String> = files
        .into_iter()
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|name| name.starts_with('.') && name.contains(PARTIAL_MARKER))
        })
        .filter_map(|path| {
            path.strip_prefix(base).ok().map(|key| {
                key.components()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect();
    keys.sort();

    Ok(keys)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
