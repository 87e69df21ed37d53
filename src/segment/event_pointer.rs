use std::cmp::Ordering;

use arrow::record_batch::RecordBatch;

use crate::{
    relation::{EventColumns, Op},
    trie::{compare_to_path, TrieError, TriePath},
};

/// One event as seen by the validity oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRow<'a> {
    /// Raw iid bytes.
    pub iid: &'a [u8],
    /// System time the event was recorded.
    pub system_from: i64,
    /// Inclusive valid-time start.
    pub valid_from: i64,
    /// Exclusive valid-time end.
    pub valid_to: i64,
    /// Event kind.
    pub op: Op,
}

/// Forward-only cursor over one page, restricted to rows under a path.
///
/// The page must be ordered by iid, which makes the rows under any path a
/// contiguous run; the cursor starts at the first of them.
#[derive(Debug)]
pub struct EventRowPointer {
    page: RecordBatch,
    events: EventColumns,
    path: TriePath,
    index: usize,
}

impl EventRowPointer {
    /// Position a cursor on the first row of `page` at or after `path`.
    pub fn new(page: RecordBatch, path: TriePath) -> Result<Self, TrieError> {
        let events = EventColumns::try_new(&page)?;
        let (mut left, mut right) = (0, events.len());
        while left < right {
            let mid = left + (right - left) / 2;
            if compare_to_path(events.iid(mid), &path) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        Ok(Self {
            page,
            events,
            path,
            index: left,
        })
    }

    /// Whether the cursor sits on a row under its path.
    pub fn is_valid(&self) -> bool {
        self.index < self.events.len()
            && compare_to_path(self.events.iid(self.index), &self.path) != Ordering::Greater
    }

    /// Move to the next row.
    pub fn advance(&mut self) {
        self.index += 1;
    }

    /// Row index within the page.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The page being walked.
    pub fn page(&self) -> &RecordBatch {
        &self.page
    }

    /// iid bytes of the current row.
    pub fn iid(&self) -> &[u8] {
        self.events.iid(self.index)
    }

    /// `_system_from` of the current row.
    pub fn system_from(&self) -> i64 {
        self.events.system_from(self.index)
    }

    /// `_valid_to` of the current row.
    pub fn valid_to(&self) -> i64 {
        self.events.valid_to(self.index)
    }

    /// Current row as an [`EventRow`].
    pub fn row(&self) -> Result<EventRow<'_>, TrieError> {
        Ok(EventRow {
            iid: self.events.iid(self.index),
            system_from: self.events.system_from(self.index),
            valid_from: self.events.valid_from(self.index),
            valid_to: self.events.valid_to(self.index),
            op: self.events.op(self.index)?,
        })
    }
}
