//! Which compaction jobs exist, and how one is carried out.

use std::{collections::BTreeMap, fmt, sync::Arc};

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::file::properties::WriterProperties;
use tokio_util::sync::CancellationToken;

use super::{
    page_tree::PageTree,
    segment_merge::{merge_segments, SegmentMergeOptions},
    CompactionError,
};
use crate::{
    catalog::{AddedTrie, TrieCatalog},
    fs::BufferPool,
    observability::log_debug,
    option::CompactorOptions,
    segment::{PathFilter, Segment, TrieSegment},
    trie::{
        encode_metadata, write_relation, SortedRelation, TableName, TrieKey,
        TrieOutput, TriePath, TrieWriter, LEVEL_WIDTH,
    },
};

/// Tries merged at once by [`LeveledJobPolicy`].
pub const LEVEL_FAN_IN: usize = LEVEL_WIDTH;

/// Identity of a job: the current trie it produces.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    /// Table the job compacts.
    pub table: TableName,
    /// Key of the current output trie.
    pub output: TrieKey,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.output)
    }
}

/// A unit of compaction work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    /// Identity of the job.
    pub key: JobKey,
    /// Tries merged by the job.
    pub inputs: Vec<TrieKey>,
    /// Hash partition the job writes.
    pub part: TriePath,
}

/// Strategy deciding which jobs are available and executing them.
///
/// `available_jobs` must be cheap to call repeatedly and must stop offering a
/// job once its output is registered, which makes repeated scans converge.
pub trait JobPolicy: Send + Sync + 'static {
    /// Jobs that could run now.
    fn available_jobs(&self) -> Vec<Job>;

    /// Run `job`, write its tries to storage and describe them.
    ///
    /// Runs on a blocking thread; `cancel` is polled while merging.
    fn execute_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Vec<AddedTrie>, CompactionError>;
}

/// Merges the four oldest live current tries of a `(level, part)` into the
/// four partitions one level down.
#[derive(Debug)]
pub struct LeveledJobPolicy {
    pool: Arc<dyn BufferPool>,
    catalog: Arc<TrieCatalog>,
    options: CompactorOptions,
}

impl LeveledJobPolicy {
    /// Policy over the tries registered in `catalog`, stored in `pool`.
    pub fn new(
        pool: Arc<dyn BufferPool>,
        catalog: Arc<TrieCatalog>,
        options: CompactorOptions,
    ) -> Self {
        Self {
            pool,
            catalog,
            options,
        }
    }

    fn table_jobs(&self, table: &TableName, jobs: &mut Vec<Job>) {
        let mut groups: BTreeMap<(u64, TriePath), Vec<TrieKey>> = BTreeMap::new();
        for key in self.catalog.live_tries(table) {
            if key.is_current() {
                groups
                    .entry((key.level, key.part_path()))
                    .or_default()
                    .push(key);
            }
        }

        for ((level, part), mut keys) in groups {
            if keys.len() < LEVEL_FAN_IN {
                continue;
            }
            keys.sort_by_key(|key| key.block_index);
            keys.truncate(LEVEL_FAN_IN);
            let block_index = keys.iter().map(|key| key.block_index).max().unwrap_or_default();

            for nibble in 0..LEVEL_WIDTH as u8 {
                let output = TrieKey {
                    level: level + 1,
                    recency: None,
                    part: Some(part.conj(nibble)),
                    block_index,
                };
                if self.catalog.contains(table, &output) {
                    continue;
                }
                jobs.push(Job {
                    key: JobKey {
                        table: table.clone(),
                        output,
                    },
                    inputs: keys.clone(),
                    part: part.conj(nibble),
                });
            }
        }
    }
}

impl JobPolicy for LeveledJobPolicy {
    fn available_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for table in self.catalog.tables() {
            self.table_jobs(&table, &mut jobs);
        }
        jobs
    }

    fn execute_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Vec<AddedTrie>, CompactionError> {
        let table = &job.key.table;
        let segments = job
            .inputs
            .iter()
            .map(|key| TrieSegment::open(&self.pool, table, key))
            .collect::<Result<Vec<Arc<dyn Segment>>, _>>()?;

        let filter = PathFilter::new(job.part.clone());
        let merge_options = SegmentMergeOptions {
            recency: Some(self.options.recency_partition),
            tombstone_scope: self.options.tombstone_scope,
            writer_props: self.options.write_parquet_option.clone(),
        };
        let results = merge_segments(&segments, Some(&filter), &merge_options, cancel)?;

        let mut added = Vec::with_capacity(results.results().len());
        for result in results.results() {
            let pages = result.pages()?;
            let mut writer = TrieWriter::new(
                Vec::new(),
                results.schema().clone(),
                self.options.write_parquet_option.clone(),
            )?;
            if let Some(tree) = PageTree::build(result.leaves.clone())? {
                let mut loader = |page_idx| pages.read_page(page_idx);
                writer.write_page_tree(&mut loader, &tree, self.options.page_limit, cancel)?;
            }
            let key = TrieKey {
                recency: result.recency,
                ..job.key.output.clone()
            };
            added.push(put_trie(self.pool.as_ref(), table, key, writer.end()?)?);
        }

        log_debug!(
            "leveled_policy",
            "job_written",
            job = %job.key,
            inputs = job.inputs.len(),
            outputs = added.len(),
        );
        Ok(added)
    }
}

/// Store a finished trie: the data object first, then its metadata.
pub fn put_trie(
    pool: &dyn BufferPool,
    table: &TableName,
    key: TrieKey,
    output: TrieOutput<Vec<u8>>,
) -> Result<AddedTrie, CompactionError> {
    pool.put_object(&table.data_file_path(&key), Bytes::from(output.data))?;
    pool.put_object(
        &table.meta_file_path(&key),
        Bytes::from(encode_metadata(&output.trie)),
    )?;
    Ok(AddedTrie {
        table: table.clone(),
        trie_key: key,
        data_file_size: output.data_file_size,
        row_count: output.trie.stats().row_count,
    })
}

/// Sort `batch` and store it as the complete trie `key` of `table`.
///
/// The returned entry still has to be registered with a catalog.
pub fn write_trie(
    pool: &dyn BufferPool,
    table: &TableName,
    key: TrieKey,
    batch: &RecordBatch,
    page_limit: usize,
    props: Option<WriterProperties>,
) -> Result<AddedTrie, CompactionError> {
    let rel = SortedRelation::sort(batch)?;
    let writer = TrieWriter::new(Vec::new(), rel.batch().schema(), props)?;
    let output = write_relation(writer, &rel, page_limit, &CancellationToken::new())?;
    put_trie(pool, table, key, output)
}
