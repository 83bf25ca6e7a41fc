//! # Storage driver
//!
//! The capability trait shared by every object storage backend, and the
//! error type they report through.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
