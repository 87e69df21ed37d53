use std::{path::PathBuf, time::Duration};

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

use super::policy::JobKey;
use crate::{fs::StorageError, log::LogError, trie::TrieError};

/// Errors surfaced by compaction jobs and the compactor handle.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The job observed cooperative cancellation.
    #[error("compaction cancelled")]
    Cancelled,
    /// An object the job depends on is absent from storage.
    #[error("compaction input missing: {}", .0.display())]
    MissingObject(PathBuf),
    /// Building, encoding or decoding a trie failed.
    #[error("compaction trie error: {0}")]
    Trie(TrieError),
    /// Storage failed for a reason other than a missing object.
    #[error("compaction storage error: {0}")]
    Storage(StorageError),
    /// Appending the publication record failed.
    #[error("compaction log error: {0}")]
    Log(#[from] LogError),
    /// Arrow kernel failure while merging pages.
    #[error("compaction arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// Parquet failure while reading or staging pages.
    #[error("compaction parquet error: {0}")]
    Parquet(#[from] ParquetError),
    /// Local I/O failure on temporary files.
    #[error("compaction io error: {0}")]
    Io(#[from] std::io::Error),
    /// `compact_all` gave up waiting for the compactor to go idle.
    #[error("compactor did not go idle within {0:?}")]
    Timeout(Duration),
    /// The compactor is closed.
    #[error("compactor closed")]
    Closed,
    /// A job panicked on its worker thread.
    #[error("compaction job panicked: {0}")]
    JobPanicked(String),
    /// `compact_all` found only jobs that failed and wait for a retry.
    #[error("compaction job {key} failed: {message}")]
    JobFailed {
        /// First failed job still on offer.
        key: JobKey,
        /// Error of its last attempt.
        message: String,
    },
}

impl CompactionError {
    /// Whether this is expected cooperative cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompactionError::Cancelled)
    }
}

impl From<TrieError> for CompactionError {
    fn from(err: TrieError) -> Self {
        match err {
            TrieError::Cancelled => CompactionError::Cancelled,
            err => CompactionError::Trie(err),
        }
    }
}

impl From<StorageError> for CompactionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(path) => CompactionError::MissingObject(path),
            err => CompactionError::Storage(err),
        }
    }
}
