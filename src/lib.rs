#![deny(missing_docs)]
//! Compaction engine for bitemporal event tables stored as hash tries.
//!
//! Every table is a set of immutable tries. A trie partitions event rows by
//! the bits of their entity id (`iid`) and stores each leaf as one Parquet
//! row group, with the node table kept in a separate metadata object.
//! Compaction merges several tries of one level into the four hash
//! partitions of the next. On the way it drops event versions that newer
//! ones fully supersede and routes closed valid-time history into
//! recency-bucketed tries.
//!
//! The [`compaction::Compactor`] schedules jobs offered by a
//! [`compaction::JobPolicy`] and publishes results through the
//! [`catalog::Catalog`] and [`log::Log`] seams.

mod observability;

/// In-memory trie registry.
pub mod catalog;
/// Merge engine, job policy and scheduler.
pub mod compaction;
/// Object storage.
pub mod fs;
/// Publication log.
pub mod log;
/// Compactor options.
pub mod option;
/// Recency buckets of valid time.
pub mod recency;
/// Event relation schema and helpers.
pub mod relation;
/// Read views over stored tries.
pub mod segment;
/// Hash-trie layout, keys and codecs.
pub mod trie;

pub use crate::{
    catalog::{AddedTrie, Catalog, TrieCatalog},
    compaction::{CompactionError, Compactor, JobPolicy, LeveledJobPolicy, TombstoneScope},
    log::{InMemoryLog, Log, LogMessage},
    option::CompactorOptions,
    recency::RecencyPartition,
    trie::{Iid, TableName, TrieKey},
};
