//! Bitemporal visibility of merged events.

use crate::{relation::Op, segment::EventRow};

/// Outcome of feeding one event to a [`ValidityState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// The event still describes some observable interval; copy it.
    Visible,
    /// Newer events supersede or erase it entirely.
    Dropped,
}

/// Oracle deciding which events survive a merge.
///
/// Fed every event of one merge task in order: grouped by iid, newest system
/// time first within an entity.
pub trait ValidityState {
    /// Classify `row`.
    fn evaluate(&mut self, row: &EventRow<'_>) -> Visibility;
}

/// Keeps an event while part of its valid-time interval is not yet covered
/// by a newer event of the same entity.
///
/// Erase covers all of valid time, so it and everything older is dropped.
#[derive(Debug, Default)]
pub struct ValidTimeCeiling {
    iid: Vec<u8>,
    erased: bool,
    /// Disjoint covered `[from, to)` ranges, ascending.
    covered: Vec<(i64, i64)>,
}

impl ValidTimeCeiling {
    /// A fresh oracle.
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self, iid: &[u8]) {
        self.iid.clear();
        self.iid.extend_from_slice(iid);
        self.erased = false;
        self.covered.clear();
    }

    fn is_covered(&self, from: i64, to: i64) -> bool {
        let mut cursor = from;
        for &(start, end) in &self.covered {
            if cursor >= to {
                break;
            }
            if start > cursor {
                return false;
            }
            cursor = cursor.max(end);
        }
        cursor >= to
    }

    fn cover(&mut self, from: i64, to: i64) {
        if from >= to {
            return;
        }
        let mut merged = Vec::with_capacity(self.covered.len() + 1);
        let (mut from, mut to) = (from, to);
        for &(start, end) in &self.covered {
            if end < from || start > to {
                merged.push((start, end));
            } else {
                from = from.min(start);
                to = to.max(end);
            }
        }
        let pos = merged.partition_point(|&(start, _)| start < from);
        merged.insert(pos, (from, to));
        self.covered = merged;
    }
}

impl ValidityState for ValidTimeCeiling {
    fn evaluate(&mut self, row: &EventRow<'_>) -> Visibility {
        if self.iid != row.iid {
            self.reset(row.iid);
        }
        if self.erased {
            return Visibility::Dropped;
        }
        match row.op {
            Op::Erase => {
                self.erased = true;
                Visibility::Dropped
            }
            Op::Put | Op::Delete => {
                if self.is_covered(row.valid_from, row.valid_to) {
                    Visibility::Dropped
                } else {
                    self.cover(row.valid_from, row.valid_to);
                    Visibility::Visible
                }
            }
        }
    }
}
