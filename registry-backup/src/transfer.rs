//! The blob transfer worker pool.
//!
//! A run takes a list of [`TransferTask`]s and copies each object from a
//! source bucket to a destination bucket. A fixed number of workers pull
//! tasks from one shared queue in order; results are folded into a shared
//! [`TransferReport`]. A failed task is recorded and the worker moves on.

use std::collections::VecDeque;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use storage::{StorageBucket, StorageError};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::io::InspectReader;
use tracing::Instrument;

use crate::error::{BackupError, BackupResult};
use crate::layout::NamespaceKeys;
use crate::model::Digest;

/// Size of the in-memory pipe between download and upload.
const COPY_BUFFER: usize = 64 * 1024;

/// One object to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    /// Content digest of the object.
    pub digest: Digest,

    /// Key in the source bucket.
    pub source_key: Utf8PathBuf,

    /// Key in the destination bucket.
    pub dest_key: Utf8PathBuf,

    /// Size recorded by the catalog, checked after the copy.
    pub expected_size: Option<u64>,
}

impl TransferTask {
    /// A blob of `namespace`, which lives at the same key in both buckets.
    pub fn blob(keys: &NamespaceKeys, digest: Digest, expected_size: Option<u64>) -> Self {
        let key = keys.blob(&digest);
        Self {
            digest,
            source_key: key.clone(),
            dest_key: key,
            expected_size,
        }
    }
}

/// How a run behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Number of concurrent workers, at least one.
    pub workers: usize,

    /// Copy objects even when the destination already has them.
    pub force: bool,

    /// Decide, but write nothing.
    pub dry_run: bool,

    /// Hash copied bytes and compare them with the digest.
    pub verify_digests: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            force: false,
            dry_run: false,
            verify_digests: false,
        }
    }
}

/// Why a single task failed.
#[derive(Debug, thiserror::Error)]
pub enum TransferFailure {
    /// A storage call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The copied object has the wrong size.
    #[error("size mismatch: expected {expected} bytes, copied {actual}")]
    SizeMismatch {
        /// Size from the catalog.
        expected: u64,
        /// Bytes copied.
        actual: u64,
    },

    /// The copied bytes do not hash to the digest.
    #[error("digest mismatch: copied bytes hash to {actual}")]
    DigestMismatch {
        /// Hex SHA-256 of the copied bytes.
        actual: String,
    },
}

impl TransferFailure {
    /// Whether running the task again could succeed. Bad copies never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferFailure::Storage(error) => error.is_retryable(),
            TransferFailure::SizeMismatch { .. } | TransferFailure::DigestMismatch { .. } => false,
        }
    }
}

/// The result of one task.
#[derive(Debug)]
pub enum Outcome {
    /// The destination already had the object.
    Skipped,

    /// The object was copied; carries the byte count.
    Transferred(u64),

    /// Dry run: the object would have been copied.
    Planned,

    /// The task failed.
    Failed(TransferFailure),
}

/// A task that failed, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    /// The blob.
    pub digest: Digest,

    /// Rendered error.
    pub error: String,
}

/// Totals of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Tasks submitted.
    pub total: usize,

    /// Tasks finished, whatever the outcome.
    pub processed: usize,

    /// Tasks skipped because the destination had the object.
    pub skipped: usize,

    /// Tasks copied.
    pub transferred: usize,

    /// Tasks that a dry run would have copied.
    pub planned: usize,

    /// Bytes copied.
    pub bytes: u64,

    /// Failed tasks.
    pub failed: Vec<FailedTransfer>,
}

impl TransferReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Whether no task failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, task: &TransferTask, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Skipped => self.skipped += 1,
            Outcome::Transferred(bytes) => {
                self.transferred += 1;
                self.bytes += bytes;
            }
            Outcome::Planned => self.planned += 1,
            Outcome::Failed(error) => self.failed.push(FailedTransfer {
                digest: task.digest.clone(),
                error: error.to_string(),
            }),
        }
    }
}

/// Copies tasks from one bucket to another with a worker pool.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    source: StorageBucket,
    dest: StorageBucket,
    options: TransferOptions,
}

impl TransferEngine {
    /// An engine copying from `source` into `dest`.
    pub fn new(source: StorageBucket, dest: StorageBucket, options: TransferOptions) -> Self {
        Self {
            source,
            dest,
            options,
        }
    }

    /// Run every task and report the totals.
    ///
    /// Only a panicking worker fails the run, after the other workers have
    /// finished the queue.
    #[tracing::instrument(skip_all, fields(
        source = self.source.name(),
        dest = self.dest.name(),
        tasks = tasks.len(),
        workers = self.options.workers,
    ))]
    pub async fn run(&self, tasks: Vec<TransferTask>) -> BackupResult<TransferReport> {
        let total = tasks.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let report = Arc::new(Mutex::new(TransferReport::new(total)));

        let mut workers = JoinSet::new();
        for id in 0..self.options.workers.max(1) {
            let worker = Worker {
                id,
                total,
                source: self.source.clone(),
                dest: self.dest.clone(),
                options: self.options,
                queue: queue.clone(),
                report: report.clone(),
            };
            workers.spawn(worker.run().instrument(tracing::debug_span!("worker", id)));
        }

        let mut panicked = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "Transfer worker failed");
                panicked.get_or_insert(error);
            }
        }
        if let Some(error) = panicked {
            return Err(BackupError::WorkerPanicked(error));
        }

        let report = std::mem::take(&mut *report.lock());
        tracing::info!(
            processed = report.processed,
            transferred = report.transferred,
            skipped = report.skipped,
            planned = report.planned,
            failed = report.failed.len(),
            bytes = report.bytes,
            "Transfer finished"
        );
        Ok(report)
    }
}

struct Worker {
    id: usize,
    total: usize,
    source: StorageBucket,
    dest: StorageBucket,
    options: TransferOptions,
    queue: Arc<Mutex<VecDeque<TransferTask>>>,
    report: Arc<Mutex<TransferReport>>,
}

impl Worker {
    async fn run(self) {
        let mut handled = 0usize;
        loop {
            let next = self.queue.lock().pop_front();
            let Some(task) = next else {
                break;
            };

            let outcome = self.process(&task).await;
            if let Outcome::Failed(error) = &outcome {
                tracing::warn!(
                    digest = %task.digest,
                    %error,
                    retryable = error.is_retryable(),
                    "Transfer failed"
                );
            }

            let processed = {
                let mut report = self.report.lock();
                report.record(&task, outcome);
                report.processed
            };
            handled += 1;
            tracing::debug!(
                worker = self.id,
                handled,
                "Progress: {processed}/{}",
                self.total
            );
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(digest = %task.digest))]
    async fn process(&self, task: &TransferTask) -> Outcome {
        match self.dest.exists(&task.dest_key).await {
            Ok(true) if !self.options.force => return Outcome::Skipped,
            Ok(_) => {}
            Err(error) => return Outcome::Failed(error.into()),
        }

        if self.options.dry_run {
            return Outcome::Planned;
        }

        match self.copy(task).await {
            Ok(bytes) => Outcome::Transferred(bytes),
            Err(error) => Outcome::Failed(error),
        }
    }

    /// Stream the source object into the destination, counting and
    /// optionally hashing the bytes on the way.
    async fn copy(&self, task: &TransferTask) -> Result<u64, TransferFailure> {
        let (writer, reader) = tokio::io::duplex(COPY_BUFFER);
        let verify = self.options.verify_digests;
        let mut bytes = 0u64;
        let mut hasher = Sha256::new();

        let source = &self.source;
        let source_key = &task.source_key;
        let download = async move {
            let mut writer = writer;
            source.download(source_key, &mut writer).await?;
            writer
                .shutdown()
                .await
                .map_err(|error| StorageError::io("pipe", error).path(source_key.as_str()).build())
        };

        let copied = {
            let inspect = InspectReader::new(reader, |chunk: &[u8]| {
                bytes += chunk.len() as u64;
                if verify {
                    hasher.update(chunk);
                }
            });
            let mut reader = BufReader::with_capacity(COPY_BUFFER, inspect);
            let upload = self.dest.upload(&task.dest_key, &mut reader);
            tokio::try_join!(download, upload)
        };
        copied?;

        if let Some(expected) = task.expected_size {
            if expected != bytes {
                self.discard(task).await;
                return Err(TransferFailure::SizeMismatch {
                    expected,
                    actual: bytes,
                });
            }
        }

        if verify {
            let hash = hasher.finalize();
            if !task.digest.matches(&hash) {
                self.discard(task).await;
                return Err(TransferFailure::DigestMismatch {
                    actual: hex::encode(hash),
                });
            }
        }

        Ok(bytes)
    }

    async fn discard(&self, task: &TransferTask) {
        if let Err(error) = self.dest.delete(&task.dest_key).await {
            tracing::warn!(key = %task.dest_key, %error, "Could not remove bad copy");
        }
    }
}
