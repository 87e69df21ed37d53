//! Object storage seen by the compactor.
//!
//! Tries are immutable objects addressed by relative paths. Metadata objects
//! are read whole; data objects are read by byte range so a merge only pulls
//! the footer and the pages it touches.

mod local;
mod memory;

use std::{
    fmt, io,
    ops::Range,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use thiserror::Error;

pub use local::LocalBufferPool;
pub use memory::MemoryBufferPool;

/// Errors raised by a [`BufferPool`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object is stored under the path.
    #[error("object not found: {}", .0.display())]
    NotFound(PathBuf),
    /// A ranged read reached past the end of the object.
    #[error("range {range:?} out of bounds for {} ({size} bytes)", .path.display())]
    OutOfBounds {
        /// Object read.
        path: PathBuf,
        /// Requested byte range.
        range: Range<u64>,
        /// Size of the object.
        size: u64,
    },
    /// The backing store failed.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

/// Object storage keyed by relative paths.
///
/// `put_object` must make the object visible atomically: readers observe
/// either no object or the complete bytes.
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Read the object at `path`.
    fn get_object(&self, path: &Path) -> Result<Bytes, StorageError>;

    /// Size of the object at `path` in bytes.
    fn object_size(&self, path: &Path) -> Result<u64, StorageError>;

    /// Read `range` of the object at `path`.
    ///
    /// A range reaching past the end of the object is an error.
    fn get_range(&self, path: &Path, range: Range<u64>) -> Result<Bytes, StorageError>;

    /// Store `data` at `path`, replacing any previous object.
    fn put_object(&self, path: &Path, data: Bytes) -> Result<(), StorageError>;

    /// Paths of all objects below `dir`, sorted.
    fn list_objects(&self, dir: &Path) -> Result<Vec<PathBuf>, StorageError>;

    /// Remove the object at `path`; absent objects are not an error.
    fn delete_object(&self, path: &Path) -> Result<(), StorageError>;
}
