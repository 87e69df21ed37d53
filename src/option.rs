use std::{num::NonZeroUsize, thread, time::Duration};

use parquet::file::properties::WriterProperties;

use crate::{compaction::TombstoneScope, recency::RecencyPartition};

/// Tuning knobs of the compactor and of the tries its jobs write.
#[derive(Debug, Clone)]
pub struct CompactorOptions {
    pub(crate) threads: usize,
    pub(crate) page_limit: usize,
    pub(crate) recency_partition: RecencyPartition,
    pub(crate) tombstone_scope: TombstoneScope,
    pub(crate) ignore_block_signal: bool,
    pub(crate) close_grace: Duration,
    pub(crate) write_parquet_option: Option<WriterProperties>,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .div_ceil(2);
        CompactorOptions {
            threads,
            page_limit: 256,
            recency_partition: RecencyPartition::Week,
            tombstone_scope: TombstoneScope::PerEntity,
            ignore_block_signal: false,
            close_grace: Duration::from_secs(5),
            write_parquet_option: None,
        }
    }
}

impl CompactorOptions {
    /// Maximum number of jobs executing at once; at least one.
    pub fn threads(self, threads: usize) -> Self {
        CompactorOptions {
            threads: threads.max(1),
            ..self
        }
    }

    /// Rows above which a page is split by the next iid nibble.
    pub fn page_limit(self, page_limit: usize) -> Self {
        CompactorOptions {
            page_limit: page_limit.max(1),
            ..self
        }
    }

    /// Granularity of historical output buckets.
    pub fn recency_partition(self, recency_partition: RecencyPartition) -> Self {
        CompactorOptions {
            recency_partition,
            ..self
        }
    }

    /// Scope of the single retained tombstone in the page merge.
    pub fn tombstone_scope(self, tombstone_scope: TombstoneScope) -> Self {
        CompactorOptions {
            tombstone_scope,
            ..self
        }
    }

    /// Ignore `signal_block` wakeups; scans then only follow job completion
    /// and `compact_all`.
    pub fn ignore_block_signal(self, ignore_block_signal: bool) -> Self {
        CompactorOptions {
            ignore_block_signal,
            ..self
        }
    }

    /// How long `close` waits for in-flight jobs before giving up on them.
    pub fn close_grace(self, close_grace: Duration) -> Self {
        CompactorOptions {
            close_grace,
            ..self
        }
    }

    /// Parquet properties for trie data files.
    pub fn write_parquet_option(self, write_parquet_option: WriterProperties) -> Self {
        CompactorOptions {
            write_parquet_option: Some(write_parquet_option),
            ..self
        }
    }

    /// Configured worker count.
    pub fn worker_threads(&self) -> usize {
        self.threads
    }

    /// Configured page limit.
    pub fn rows_per_page(&self) -> usize {
        self.page_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_clamp_to_usable_values() {
        let opts = CompactorOptions::default()
            .threads(0)
            .page_limit(0)
            .recency_partition(RecencyPartition::Quarter)
            .tombstone_scope(TombstoneScope::PerTask);
        assert_eq!(opts.worker_threads(), 1);
        assert_eq!(opts.rows_per_page(), 1);
        assert_eq!(opts.recency_partition, RecencyPartition::Quarter);
        assert_eq!(opts.tombstone_scope, TombstoneScope::PerTask);
        assert_eq!(CompactorOptions::default().close_grace, Duration::from_secs(5));
    }
}
