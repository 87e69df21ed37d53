//! Read-only views of published tries used as merge inputs.

mod event_pointer;
mod merge_plan;

use std::{fmt, path::PathBuf, sync::Arc};

use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use bytes::{Buf, Bytes};
use parquet::{
    errors::ParquetError,
    file::reader::{ChunkReader, Length},
};

pub use event_pointer::{EventRow, EventRowPointer};
pub use merge_plan::{to_merge_plan, MergePlanNode, MergePlanTask, PathFilter};

use crate::{
    compaction::CompactionError,
    fs::BufferPool,
    trie::{decode_metadata, HashTrie, PageReader, TableName, TrieError, TrieKey, TriePath},
};

/// Immutable handle onto one trie, shareable between jobs.
pub trait Segment: Send + Sync + fmt::Debug {
    /// Decoded trie metadata.
    fn trie(&self) -> &HashTrie;

    /// Schema of the data pages.
    fn schema(&self) -> &SchemaRef;

    /// Hash partition the trie covers, if any.
    fn part(&self) -> Option<&TriePath>;

    /// Rows of page `page_idx`.
    fn load_page(&self, page_idx: u32) -> Result<RecordBatch, TrieError>;
}

/// Segment over a trie stored in a [`BufferPool`].
///
/// Opening reads the metadata object and the data file's footer; pages are
/// fetched by byte range on demand.
#[derive(Debug)]
pub struct TrieSegment {
    key: TrieKey,
    trie: HashTrie,
    pages: PageReader<ObjectReader>,
}

impl TrieSegment {
    /// Open the trie `key` of `table`.
    ///
    /// A missing metadata or data object surfaces as
    /// [`CompactionError::MissingObject`], a leaf pointing past the data
    /// file's pages as [`TrieError::PageOutOfRange`].
    pub fn open(
        pool: &Arc<dyn BufferPool>,
        table: &TableName,
        key: &TrieKey,
    ) -> Result<Arc<dyn Segment>, CompactionError> {
        let meta = pool.get_object(&table.meta_file_path(key))?;
        let trie = decode_metadata(&meta)?;
        let pages = PageReader::try_new(ObjectReader::open(pool, table.data_file_path(key))?)?;
        let page_count = pages.page_count();
        if let Some(page_idx) = trie
            .leaf_pages()?
            .into_iter()
            .find(|&page_idx| page_idx as usize >= page_count)
        {
            return Err(TrieError::PageOutOfRange {
                page_idx,
                page_count,
            }
            .into());
        }
        Ok(Arc::new(Self {
            key: key.clone(),
            trie,
            pages,
        }))
    }

    /// Key of the underlying trie.
    pub fn key(&self) -> &TrieKey {
        &self.key
    }
}

impl Segment for TrieSegment {
    fn trie(&self) -> &HashTrie {
        &self.trie
    }

    fn schema(&self) -> &SchemaRef {
        self.pages.schema()
    }

    fn part(&self) -> Option<&TriePath> {
        self.key.part.as_ref()
    }

    fn load_page(&self, page_idx: u32) -> Result<RecordBatch, TrieError> {
        self.pages.read_page(page_idx)
    }
}

/// Byte-range view of a stored data object for the Parquet reader.
#[derive(Debug)]
struct ObjectReader {
    pool: Arc<dyn BufferPool>,
    path: PathBuf,
    size: u64,
}

impl ObjectReader {
    fn open(pool: &Arc<dyn BufferPool>, path: PathBuf) -> Result<Self, CompactionError> {
        let size = pool.object_size(&path)?;
        Ok(Self {
            pool: Arc::clone(pool),
            path,
            size,
        })
    }
}

impl Length for ObjectReader {
    fn len(&self) -> u64 {
        self.size
    }
}

impl ChunkReader for ObjectReader {
    type T = bytes::buf::Reader<Bytes>;

    fn get_read(&self, start: u64) -> Result<Self::T, ParquetError> {
        Ok(self
            .get_bytes(start, self.size.saturating_sub(start) as usize)?
            .reader())
    }

    fn get_bytes(&self, start: u64, length: usize) -> Result<Bytes, ParquetError> {
        self.pool
            .get_range(&self.path, start..start + length as u64)
            .map_err(|err| ParquetError::External(Box::new(err)))
    }
}
