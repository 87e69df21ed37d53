//! Compaction: merging tries into the next level.
//!
//! Jobs come from a [`JobPolicy`] and run under the [`Compactor`]
//! scheduler. A job merges segments task by task ([`merge_task`]) into
//! staged relations ([`OutWriter`]), then rewrites each staged relation as
//! a trie ([`PageTree`]).

mod error;
/// Staging of merged rows into current and historical relations.
pub mod out_writer;
mod page_merge;
mod page_tree;
/// Job identities, the policy seam and the leveled policy.
pub mod policy;
mod scheduler;
mod segment_merge;
/// Bitemporal visibility oracle.
pub mod validity;

pub use error::CompactionError;
pub use out_writer::{
    MergeResult, MergeResults, OutWriter, PartitionedOutWriter, SingleOutWriter, SourceId,
};
pub use page_merge::{merge_task, PageMergeStats, TombstoneScope};
pub use page_tree::{PageLeaf, PageTree};
pub use policy::{put_trie, write_trie, Job, JobKey, JobPolicy, LeveledJobPolicy, LEVEL_FAN_IN};
pub use scheduler::Compactor;
pub use segment_merge::{merge_segments, merge_segments_with, merge_to_relation, SegmentMergeOptions};
pub use validity::{ValidTimeCeiling, ValidityState, Visibility};
