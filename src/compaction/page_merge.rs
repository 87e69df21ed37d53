//! k-way merge of the pages contributing to one merge-plan task.

use std::{cmp::Ordering, collections::BinaryHeap};

use arrow::datatypes::SchemaRef;
use tokio_util::sync::CancellationToken;

use super::{
    out_writer::OutWriter,
    validity::{ValidityState, Visibility},
    CompactionError,
};
use crate::{
    relation::align_batch,
    segment::{EventRowPointer, MergePlanTask, PathFilter},
    trie::{Iid, TrieError},
};

/// How far the "keep one dropped row" allowance reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TombstoneScope {
    /// The first dropped row of every entity is kept.
    #[default]
    PerEntity,
    /// Only the first dropped row of the whole task is kept.
    PerTask,
}

/// Heap entry of one cursor; the max-heap pops the smallest iid first,
/// then the newest system time, then the earliest source.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    iid: Iid,
    system_from: i64,
    cursor: usize,
}

impl HeapEntry {
    fn of(ptr: &EventRowPointer, cursor: usize) -> Result<Self, TrieError> {
        Ok(Self {
            iid: Iid::try_from(ptr.iid())?,
            system_from: ptr.system_from(),
            cursor,
        })
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .iid
            .cmp(&self.iid)
            .then_with(|| self.system_from.cmp(&other.system_from))
            .then_with(|| other.cursor.cmp(&self.cursor))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome counters of one merged task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageMergeStats {
    /// Rows read from contributing pages.
    pub rows_in: usize,
    /// Rows copied to the output.
    pub rows_out: usize,
}

/// Merge the pages of `task` into `out`.
///
/// Pages are aligned to `schema` before their rows are copied. Rows judged
/// visible are copied; of the dropped rows only the first per entity (or per
/// task, see [`TombstoneScope`]) is copied. The caller ends the page.
pub fn merge_task<O, V>(
    task: &MergePlanTask,
    filter: Option<&PathFilter>,
    schema: &SchemaRef,
    out: &mut O,
    validity: &mut V,
    scope: TombstoneScope,
    cancel: &CancellationToken,
) -> Result<PageMergeStats, CompactionError>
where
    O: OutWriter + ?Sized,
    V: ValidityState + ?Sized,
{
    let path = PathFilter::effective_path(filter, &task.path);
    let mut cursors = Vec::with_capacity(task.nodes.len());
    let mut heap = BinaryHeap::with_capacity(task.nodes.len());

    for node in &task.nodes {
        let Some(page_idx) = node.page_idx()? else {
            continue;
        };
        let page = align_batch(&node.segment.load_page(page_idx)?, schema)?;
        let ptr = EventRowPointer::new(page.clone(), path.clone())?;
        if ptr.is_valid() {
            let source = out.add_source(page);
            heap.push(HeapEntry::of(&ptr, cursors.len())?);
            cursors.push((ptr, source));
        }
    }

    let mut stats = PageMergeStats::default();
    let mut kept_dropped: Option<Iid> = None;

    while let Some(entry) = heap.pop() {
        if cancel.is_cancelled() {
            return Err(CompactionError::Cancelled);
        }
        let (ptr, source) = &mut cursors[entry.cursor];
        let row = ptr.row()?;
        stats.rows_in += 1;

        let copy = match validity.evaluate(&row) {
            Visibility::Visible => true,
            Visibility::Dropped => {
                let first = match (scope, &kept_dropped) {
                    (_, None) => true,
                    (TombstoneScope::PerEntity, Some(iid)) => iid.as_bytes() != row.iid,
                    (TombstoneScope::PerTask, Some(_)) => false,
                };
                if first {
                    kept_dropped = Some(entry.iid);
                }
                first
            }
        };
        if copy {
            out.copy_row(*source, ptr.index(), ptr.valid_to());
            stats.rows_out += 1;
        }

        ptr.advance();
        if ptr.is_valid() {
            heap.push(HeapEntry::of(ptr, entry.cursor)?);
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pops_iid_then_newest_then_source() {
        let mut heap = BinaryHeap::new();
        let entry = |iid: u128, system_from: i64, cursor: usize| HeapEntry {
            iid: Iid::from_u128(iid),
            system_from,
            cursor,
        };
        heap.push(entry(2, 9, 0));
        heap.push(entry(1, 1, 0));
        heap.push(entry(1, 5, 2));
        heap.push(entry(1, 5, 1));

        let order = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.iid, e.system_from, e.cursor))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                (Iid::from_u128(1), 5, 1),
                (Iid::from_u128(1), 5, 2),
                (Iid::from_u128(1), 1, 0),
                (Iid::from_u128(2), 9, 0),
            ]
        );
    }
}
