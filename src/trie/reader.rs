use arrow::{compute::concat_batches, datatypes::SchemaRef, record_batch::RecordBatch};
use bytes::{Buf, Bytes};
use parquet::{
    arrow::arrow_reader::{
        ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
    },
    errors::ParquetError,
    file::reader::{ChunkReader, Length},
};

use super::TrieError;

/// Page access to one trie data file.
///
/// The Parquet footer is parsed once; each page read then fetches only the
/// byte range of its row group from `source`.
#[derive(Debug)]
pub struct PageReader<R> {
    source: R,
    metadata: ArrowReaderMetadata,
}

impl<R: ChunkReader> PageReader<R> {
    /// Load the footer of `source`.
    pub fn try_new(source: R) -> Result<Self, TrieError> {
        let metadata = ArrowReaderMetadata::load(&source, ArrowReaderOptions::default())?;
        Ok(Self { source, metadata })
    }

    /// Schema of every page.
    pub fn schema(&self) -> &SchemaRef {
        self.metadata.schema()
    }

    /// Number of pages (row groups) in the file.
    pub fn page_count(&self) -> usize {
        self.metadata.metadata().num_row_groups()
    }

    /// Rows of page `page_idx`.
    pub fn read_page(&self, page_idx: u32) -> Result<RecordBatch, TrieError> {
        let idx = page_idx as usize;
        let page_count = self.page_count();
        if idx >= page_count {
            return Err(TrieError::PageOutOfRange {
                page_idx,
                page_count,
            });
        }
        let row_group = self.metadata.metadata().row_group(idx);
        let (start, end) = row_group
            .columns()
            .iter()
            .map(|column| {
                let (start, len) = column.byte_range();
                (start, start + len)
            })
            .fold((u64::MAX, 0), |(lo, hi), (start, end)| {
                (lo.min(start), hi.max(end))
            });
        let chunk = RowGroupChunk {
            offset: start,
            bytes: self.source.get_bytes(start, (end - start) as usize)?,
            file_len: self.source.len(),
        };

        let num_rows = row_group.num_rows().max(1) as usize;
        let reader =
            ParquetRecordBatchReaderBuilder::new_with_metadata(chunk, self.metadata.clone())
                .with_row_groups(vec![idx])
                .with_batch_size(num_rows)
                .build()?;
        let mut batches = reader.collect::<Result<Vec<_>, _>>()?;
        if batches.len() == 1 {
            return Ok(batches.swap_remove(0));
        }
        Ok(concat_batches(self.schema(), &batches)?)
    }
}

/// Read page `page_idx` of a trie data file held in memory.
pub fn read_page(data: Bytes, page_idx: u32) -> Result<RecordBatch, TrieError> {
    PageReader::try_new(data)?.read_page(page_idx)
}

/// The fetched bytes of one row group, addressed by file offsets.
struct RowGroupChunk {
    offset: u64,
    bytes: Bytes,
    file_len: u64,
}

impl RowGroupChunk {
    fn slice(&self, start: u64, length: usize) -> Result<Bytes, ParquetError> {
        let end = start + length as u64;
        if start < self.offset || end > self.offset + self.bytes.len() as u64 {
            return Err(ParquetError::General(format!(
                "read {start}..{end} outside fetched row group {}..{}",
                self.offset,
                self.offset + self.bytes.len() as u64
            )));
        }
        let from = (start - self.offset) as usize;
        Ok(self.bytes.slice(from..from + length))
    }
}

impl Length for RowGroupChunk {
    fn len(&self) -> u64 {
        self.file_len
    }
}

impl ChunkReader for RowGroupChunk {
    type T = bytes::buf::Reader<Bytes>;

    fn get_read(&self, start: u64) -> Result<Self::T, ParquetError> {
        let remaining = (self.offset + self.bytes.len() as u64).saturating_sub(start);
        Ok(self.slice(start, remaining as usize)?.reader())
    }

    fn get_bytes(&self, start: u64, length: usize) -> Result<Bytes, ParquetError> {
        self.slice(start, length)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use parquet::file::properties::WriterProperties;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        relation::{EventColumns, EventRelationBuilder, END_OF_TIME},
        trie::{write_relation, Iid, SortedRelation, TrieWriter},
    };

    /// Counts the bytes the reader pulls from the underlying buffer.
    struct MeteredBytes {
        data: Bytes,
        fetched: Arc<AtomicU64>,
    }

    impl Length for MeteredBytes {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }
    }

    impl ChunkReader for MeteredBytes {
        type T = bytes::buf::Reader<Bytes>;

        fn get_read(&self, start: u64) -> Result<Self::T, ParquetError> {
            let bytes = self.data.slice(start as usize..);
            self.fetched.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            Ok(bytes.reader())
        }

        fn get_bytes(&self, start: u64, length: usize) -> Result<Bytes, ParquetError> {
            self.fetched.fetch_add(length as u64, Ordering::SeqCst);
            Ok(self.data.slice(start as usize..start as usize + length))
        }
    }

    fn sixteen_rows() -> SortedRelation {
        let mut builder = EventRelationBuilder::new("v");
        for n in 0..16u128 {
            builder.put(
                Iid::from_u128(n << 124),
                n as i64,
                0,
                END_OF_TIME,
                format!("value-{n}"),
            );
        }
        SortedRelation::try_new(builder.finish().expect("batch")).expect("sorted")
    }

    #[test]
    fn pages_fetch_only_their_row_group() {
        let rel = sixteen_rows();
        let writer = TrieWriter::new(Vec::new(), rel.batch().schema(), None).expect("writer");
        let out = write_relation(writer, &rel, 4, &CancellationToken::new()).expect("write");
        let data = Bytes::from(out.data);
        let fetched = Arc::new(AtomicU64::new(0));

        let pages = PageReader::try_new(MeteredBytes {
            data: data.clone(),
            fetched: fetched.clone(),
        })
        .expect("footer");
        assert_eq!(pages.page_count(), 4);
        let footer = fetched.swap(0, Ordering::SeqCst);
        assert!(footer < data.len() as u64);

        let mut system_froms = Vec::new();
        for page_idx in out.trie.leaf_pages().expect("leaves") {
            let page = pages.read_page(page_idx).expect("page");
            let events = EventColumns::try_new(&page).expect("columns");
            system_froms.extend((0..events.len()).map(|row| events.system_from(row)));
        }
        assert_eq!(system_froms, (0..16).collect::<Vec<_>>());
        assert!(fetched.load(Ordering::SeqCst) < data.len() as u64);

        assert!(matches!(
            pages.read_page(4),
            Err(TrieError::PageOutOfRange {
                page_idx: 4,
                page_count: 4
            })
        ));
    }

    #[test]
    fn row_groups_smaller_than_a_page_are_rejected() {
        let rel = sixteen_rows();
        let props = WriterProperties::builder().set_max_row_group_size(2).build();
        let writer =
            TrieWriter::new(Vec::new(), rel.batch().schema(), Some(props)).expect("writer");
        assert!(matches!(
            write_relation(writer, &rel, 4, &CancellationToken::new()),
            Err(TrieError::SplitPage {
                rows: 4,
                row_groups: 2
            })
        ));

        let props = WriterProperties::builder().set_max_row_group_size(4).build();
        let writer =
            TrieWriter::new(Vec::new(), rel.batch().schema(), Some(props)).expect("writer");
        let out = write_relation(writer, &rel, 4, &CancellationToken::new()).expect("write");
        let pages = PageReader::try_new(Bytes::from(out.data)).expect("footer");
        assert_eq!(pages.page_count(), out.trie.leaf_count());
    }
}
