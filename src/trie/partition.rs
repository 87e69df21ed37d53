//! Lays out a sorted relation as the branch/leaf skeleton of a trie.

use std::{collections::BTreeMap, io::Write};

use arrow::{
    array::{Array, FixedSizeBinaryArray},
    record_batch::RecordBatch,
};
use tokio_util::sync::CancellationToken;

use super::{
    bucket_for, NodeIdx, TrieError, TrieOutput, TrieWriter, LEVEL_WIDTH, MAX_DEPTH,
};
use crate::{
    recency::{bucket_boundary, RecencyPartition},
    relation::{take_rows, EventColumns, IID},
};

/// Row indices into a [`SortedRelation`], themselves in iid order.
pub type Selection<'a> = &'a [u32];

/// A batch known to be ordered by iid ascending.
///
/// Within one iid, rows produced by [`SortedRelation::sort`] are newest
/// first by system time.
#[derive(Clone, Debug)]
pub struct SortedRelation {
    batch: RecordBatch,
    iids: FixedSizeBinaryArray,
}

fn iid_column(batch: &RecordBatch) -> Result<FixedSizeBinaryArray, TrieError> {
    batch
        .column_by_name(IID)
        .and_then(|column| column.as_any().downcast_ref::<FixedSizeBinaryArray>())
        .cloned()
        .ok_or(TrieError::MissingColumn(IID))
}

impl SortedRelation {
    /// Wrap `batch`, rejecting it unless its iids are non-decreasing.
    pub fn try_new(batch: RecordBatch) -> Result<Self, TrieError> {
        let iids = iid_column(&batch)?;
        for row in 1..iids.len() {
            if iids.value(row - 1) > iids.value(row) {
                return Err(TrieError::Unsorted(row));
            }
        }
        Ok(Self { batch, iids })
    }

    /// Sort `batch` by iid ascending, then `_system_from` descending.
    ///
    /// Ties keep their input order.
    pub fn sort(batch: &RecordBatch) -> Result<Self, TrieError> {
        let events = EventColumns::try_new(batch)?;
        let mut indices = (0..batch.num_rows() as u32).collect::<Vec<_>>();
        indices.sort_by(|&l, &r| {
            let (l, r) = (l as usize, r as usize);
            events
                .iid(l)
                .cmp(events.iid(r))
                .then_with(|| events.system_from(r).cmp(&events.system_from(l)))
        });
        let sorted = take_rows(batch, &indices)?;
        let iids = iid_column(&sorted)?;
        Ok(Self {
            batch: sorted,
            iids,
        })
    }

    /// The underlying batch.
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    fn iid(&self, row: u32) -> &[u8] {
        self.iids.value(row as usize)
    }
}

/// Split `sel` into the 4 bucket slices starting at `starts`.
///
/// Empty buckets come back as `None`.
pub fn partition_slices<'a>(
    sel: Selection<'a>,
    starts: [usize; LEVEL_WIDTH],
) -> [Option<Selection<'a>>; LEVEL_WIDTH] {
    std::array::from_fn(|bucket| {
        let start = starts[bucket];
        let end = starts.get(bucket + 1).copied().unwrap_or(sel.len());
        (start < end).then(|| &sel[start..end])
    })
}

/// Partition `sel` by the iid nibble at `level`.
///
/// All rows of `sel` must share their first `level` nibbles, which makes the
/// nibble at `level` non-decreasing and each bucket contiguous.
pub fn iid_partitions<'a>(
    rel: &SortedRelation,
    sel: Selection<'a>,
    level: usize,
) -> [Option<Selection<'a>>; LEVEL_WIDTH] {
    let starts = std::array::from_fn(|bucket| {
        sel.partition_point(|&row| usize::from(bucket_for(rel.iid(row), level)) < bucket)
    });
    partition_slices(sel, starts)
}

/// Write the rows of `sel` as a subtree rooted at `depth`.
pub fn write_subtree<W: Write + Send>(
    writer: &mut TrieWriter<W>,
    rel: &SortedRelation,
    depth: usize,
    sel: Selection<'_>,
    page_limit: usize,
    cancel: &CancellationToken,
) -> Result<NodeIdx, TrieError> {
    if cancel.is_cancelled() {
        return Err(TrieError::Cancelled);
    }
    let (Some(&first), Some(&last)) = (sel.first(), sel.last()) else {
        return Ok(writer.write_null());
    };

    if sel.len() <= page_limit
        || depth >= MAX_DEPTH
        || rel.iid(first) == rel.iid(last)
    {
        let page = take_rows(&rel.batch, sel)?;
        return writer.write_leaf(&page);
    }

    let mut children = [None; LEVEL_WIDTH];
    for (bucket, part) in iid_partitions(rel, sel, depth).into_iter().enumerate() {
        if let Some(part) = part {
            children[bucket] = Some(write_subtree(
                writer,
                rel,
                depth + 1,
                part,
                page_limit,
                cancel,
            )?);
        }
    }
    Ok(writer.write_iid_branch(children))
}

/// Write `rel` as a complete trie and finish the writer.
pub fn write_relation<W: Write + Send>(
    mut writer: TrieWriter<W>,
    rel: &SortedRelation,
    page_limit: usize,
    cancel: &CancellationToken,
) -> Result<TrieOutput<W>, TrieError> {
    let all = (0..rel.num_rows() as u32).collect::<Vec<_>>();
    write_subtree(&mut writer, rel, 0, &all, page_limit, cancel)?;
    writer.end()
}

/// Write `rel` as one iid subtree per recency bucket of `_valid_to` under a
/// recency branch; current rows sort last.
pub fn write_relation_by_recency<W: Write + Send>(
    mut writer: TrieWriter<W>,
    rel: &SortedRelation,
    partition: RecencyPartition,
    page_limit: usize,
    cancel: &CancellationToken,
) -> Result<TrieOutput<W>, TrieError> {
    let events = EventColumns::try_new(&rel.batch)?;
    let mut buckets: BTreeMap<i64, Vec<u32>> = BTreeMap::new();
    for row in 0..rel.num_rows() {
        let boundary = bucket_boundary(partition.bucket_for(events.valid_to(row)));
        buckets.entry(boundary).or_default().push(row as u32);
    }

    let mut children = Vec::with_capacity(buckets.len());
    for (boundary, sel) in &buckets {
        let node = write_subtree(&mut writer, rel, 0, sel, page_limit, cancel)?;
        children.push((*boundary, node));
    }
    writer.write_recency_branch(children);
    writer.end()
}
