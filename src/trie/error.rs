use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

/// Errors raised while building, encoding or reading tries.
#[derive(Debug, Error)]
pub enum TrieError {
    /// Arrow kernel or batch construction failed.
    #[error("trie arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// Parquet encoding/decoding of a data file failed.
    #[error("trie parquet error: {0}")]
    Parquet(#[from] ParquetError),
    /// Local I/O failed while staging a trie.
    #[error("trie io error: {0}")]
    Io(#[from] std::io::Error),
    /// A required event column was absent or had an unexpected type.
    #[error("event relation column `{0}` missing or mistyped")]
    MissingColumn(&'static str),
    /// Input schemas could not be unified.
    #[error("incompatible relation schemas: {0}")]
    IncompatibleSchema(String),
    /// Input rows violated the iid-ascending order required by the partitioner.
    #[error("relation is not sorted by iid at row {0}")]
    Unsorted(usize),
    /// An `op` value outside put/delete/erase.
    #[error("unknown event op {0}")]
    UnknownOp(i8),
    /// A trie key string could not be parsed.
    #[error("invalid trie key `{0}`")]
    InvalidKey(String),
    /// Metadata bytes failed validation.
    #[error("corrupt trie metadata: {0}")]
    Corrupt(&'static str),
    /// A node or page index pointed outside the trie.
    #[error("trie node {0} out of range")]
    NodeOutOfRange(usize),
    /// A leaf points at a page the data file does not hold.
    #[error("trie page {page_idx} out of range, data file holds {page_count} pages")]
    PageOutOfRange {
        /// Page the leaf refers to.
        page_idx: u32,
        /// Row groups in the data file.
        page_count: usize,
    },
    /// A page did not land in exactly one Parquet row group, usually because
    /// the writer properties cap row groups below the page size.
    #[error("page of {rows} rows was written as {row_groups} row groups")]
    SplitPage {
        /// Rows in the page.
        rows: usize,
        /// Row groups the write produced.
        row_groups: usize,
    },
    /// The leaf layout of a merge result had overlapping page paths.
    #[error("overlapping page paths in leaf layout")]
    OverlappingPages,
    /// Cooperative cancellation was requested.
    #[error("trie write cancelled")]
    Cancelled,
}
