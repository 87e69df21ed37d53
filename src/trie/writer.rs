use std::io::{self, Write};

use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

use super::{HashTrie, NodeIdx, TrieError, TrieNode, TrieStats, LEVEL_WIDTH};
use crate::relation::EventColumns;

/// Writes one trie: data pages go to a Parquet sink, one row group per
/// leaf, while the node table is accumulated in post-order.
pub struct TrieWriter<W: Write + Send> {
    writer: ArrowWriter<CountingSink<W>>,
    schema: SchemaRef,
    nodes: Vec<TrieNode>,
    page_count: u32,
    stats: TrieStats,
}

/// Finished trie: the data sink plus its decoded metadata.
#[derive(Debug)]
pub struct TrieOutput<W> {
    /// Sink holding the complete Parquet data file.
    pub data: W,
    /// Node table and stats to be encoded as the metadata object.
    pub trie: HashTrie,
    /// Size of the data file in bytes.
    pub data_file_size: u64,
}

impl<W: Write + Send> TrieWriter<W> {
    /// Start a trie whose pages share `schema`.
    pub fn new(
        sink: W,
        schema: SchemaRef,
        props: Option<WriterProperties>,
    ) -> Result<Self, TrieError> {
        let writer = ArrowWriter::try_new(CountingSink::new(sink), schema.clone(), props)?;
        Ok(Self {
            writer,
            schema,
            nodes: Vec::new(),
            page_count: 0,
            stats: TrieStats::empty(),
        })
    }

    /// Schema shared by every page.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn push(&mut self, node: TrieNode) -> NodeIdx {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeIdx
    }

    /// Explicit marker for an empty subtree.
    pub fn write_null(&mut self) -> NodeIdx {
        self.push(TrieNode::Null)
    }

    /// Flush `page` as one row group and record it as a leaf.
    ///
    /// An empty page is recorded as a null node since Parquet skips empty row
    /// groups and the page index would drift.
    pub fn write_leaf(&mut self, page: &RecordBatch) -> Result<NodeIdx, TrieError> {
        if page.num_rows() == 0 {
            return Ok(self.write_null());
        }
        let events = EventColumns::try_new(page)?;
        for row in 0..events.len() {
            let stats = &mut self.stats;
            stats.min_valid_from = stats.min_valid_from.min(events.valid_from(row));
            stats.max_valid_from = stats.max_valid_from.max(events.valid_from(row));
            stats.min_valid_to = stats.min_valid_to.min(events.valid_to(row));
            stats.max_valid_to = stats.max_valid_to.max(events.valid_to(row));
            stats.min_system_from = stats.min_system_from.min(events.system_from(row));
            stats.max_system_from = stats.max_system_from.max(events.system_from(row));
        }
        self.stats.row_count += events.len() as u64;

        let page_idx = write_row_group(&mut self.writer, page)?;
        self.page_count += 1;
        Ok(self.push(TrieNode::Leaf { page_idx }))
    }

    /// Branch over the next iid nibble.
    pub fn write_iid_branch(&mut self, children: [Option<NodeIdx>; LEVEL_WIDTH]) -> NodeIdx {
        self.push(TrieNode::IidBranch { children })
    }

    /// Branch over recency buckets; `children` must be keyed by ascending boundary.
    pub fn write_recency_branch(&mut self, children: Vec<(i64, NodeIdx)>) -> NodeIdx {
        debug_assert!(children.windows(2).all(|pair| pair[0].0 < pair[1].0));
        self.push(TrieNode::RecencyBranch { children })
    }

    /// Pages flushed so far.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Close the data file and hand back the sink with the trie metadata.
    pub fn end(mut self) -> Result<TrieOutput<W>, TrieError> {
        if self.nodes.is_empty() {
            self.write_null();
        }
        let sink = self.writer.into_inner()?;
        Ok(TrieOutput {
            data_file_size: sink.written,
            data: sink.inner,
            trie: HashTrie::new(self.nodes, self.stats),
        })
    }
}

/// Write `page` as the next row group of `writer` and return its index.
///
/// `ArrowWriter` splits batches at `max_row_group_size`, which would shift
/// every later page index, so a page that does not land in exactly one row
/// group is rejected.
pub(crate) fn write_row_group<W: Write + Send>(
    writer: &mut ArrowWriter<W>,
    page: &RecordBatch,
) -> Result<u32, TrieError> {
    let before = writer.flushed_row_groups().len();
    writer.write(page)?;
    writer.flush()?;
    let row_groups = writer.flushed_row_groups().len() - before;
    if row_groups != 1 {
        return Err(TrieError::SplitPage {
            rows: page.num_rows(),
            row_groups,
        });
    }
    Ok(before as u32)
}

struct CountingSink<W> {
    inner: W,
    written: u64,
}

impl<W> CountingSink<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
