//! Common test utilities for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use chronotrie::{
    catalog::{Catalog, TrieCatalog, TrieState},
    compaction::write_trie,
    fs::{BufferPool, LocalBufferPool},
    recency::date_to_micros,
    relation::{EventRelationBuilder, END_OF_TIME},
    Compactor, CompactorOptions, InMemoryLog, Iid, LeveledJobPolicy, TableName, TrieKey,
};
use tempfile::TempDir;

/// Rows per page in every trie the helpers write.
pub const PAGE_LIMIT: usize = 4;

/// Entities 0..16 land in distinct level-2 partitions.
pub fn entity(n: u128) -> Iid {
    Iid::from_u128(n << 124)
}

/// Entity whose only version is closed in valid time.
pub fn historical_entity() -> Iid {
    Iid::from_u128(0x05 << 120)
}

/// Valid-time end of the historical entity: Wednesday 2024-01-10.
pub fn history_end() -> i64 {
    date_to_micros(NaiveDate::from_ymd_opt(2024, 1, 10).expect("date"))
}

/// One block of writes: a new version of every entity at system time `block`.
pub fn block_batch(block: u64) -> RecordBatch {
    let mut builder = EventRelationBuilder::new("name");
    for n in 0..16 {
        builder.put(
            entity(n),
            block as i64,
            0,
            END_OF_TIME,
            format!("entity-{n}@{block}"),
        );
    }
    if block == 0 {
        builder.put(historical_entity(), 0, 0, history_end(), "gone");
    }
    builder.finish().expect("block batch")
}

/// Storage, catalog and log of one test table.
pub struct Stack {
    pub pool: Arc<dyn BufferPool>,
    pub catalog: Arc<TrieCatalog>,
    pub log: Arc<InMemoryLog>,
    pub table: TableName,
    pub options: CompactorOptions,
    _dir: TempDir,
}

impl Stack {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = LocalBufferPool::new(dir.path()).expect("pool");
        Self {
            pool: Arc::new(pool),
            catalog: Arc::new(TrieCatalog::new()),
            log: Arc::new(InMemoryLog::new()),
            table: TableName::new("app.docs"),
            options: CompactorOptions::default().page_limit(PAGE_LIMIT).threads(2),
            _dir: dir,
        }
    }

    /// Write and register the level-0 trie of `block`.
    pub fn ingest(&self, block: u64) {
        let added = write_trie(
            self.pool.as_ref(),
            &self.table,
            TrieKey::l0(block),
            &block_batch(block),
            PAGE_LIMIT,
            None,
        )
        .expect("write level-0 trie");
        self.catalog.add_tries(&[added]);
    }

    pub fn policy(&self) -> Arc<LeveledJobPolicy> {
        Arc::new(LeveledJobPolicy::new(
            self.pool.clone(),
            self.catalog.clone(),
            self.options.clone(),
        ))
    }

    pub fn open_compactor(&self) -> Compactor {
        Compactor::open(
            self.policy(),
            self.catalog.clone(),
            self.log.clone(),
            &self.options,
        )
    }

    /// Rendered keys of the table's tries in `state`.
    pub fn keys_in(&self, state: TrieState) -> Vec<String> {
        self.catalog
            .tries(&self.table)
            .into_iter()
            .filter(|(_, entry)| entry.state == state)
            .map(|(key, _)| key.to_string())
            .collect()
    }
}
