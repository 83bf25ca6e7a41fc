use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the storage backend that produced them.
///
/// Callers decide how to react (treat as absent, report as a lock conflict,
/// record a failed transfer) by matching on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket was not found.
    NotFound,

    /// A conditional write found an object already present at the key.
    AlreadyExists,

    /// The caller lacks permission to perform the requested operation.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, disk, etc.).
    ///
    /// Transient and permanent failures are not distinguished.
    Io,

    /// The backing storage service is temporarily unavailable.
    ServiceUnavailable,

    /// The request was invalid (bad key, malformed parameters).
    InvalidRequest,

    /// Data serialization or deserialization failed.
    SerializationError,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// Advisory: failed transfers log it, nothing retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::Io
        )
    }

    /// Classify an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            io::ErrorKind::InvalidData => StorageErrorKind::SerializationError,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::AlreadyExists => write!(f, "already exists"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Capture is controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// Span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with a semantic kind and the operation context.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     "object not found",
/// )
/// .bucket("backups")
/// .path("acme/backup/3.json")
/// .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// assert_eq!(error.path(), Some("acme/backup/3.json"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageError::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, deriving the kind from it.
    pub fn io(engine: &'static str, error: io::Error) -> StorageErrorBuilder {
        let kind = StorageErrorKind::from_io(&error);
        StorageError::builder(engine, kind, error)
    }

    /// Create a builder for constructing a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a closure that creates a storage error from a downstream error,
    /// for use with `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object key, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns whether this error means the object was not found.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for adding optional context to a [`StorageError`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object key.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
