use std::sync::Arc;

use arrow::{compute::concat_batches, record_batch::RecordBatch};
use parquet::file::properties::WriterProperties;
use tokio_util::sync::CancellationToken;

use super::{
    out_writer::{MergeResults, OutWriter, PartitionedOutWriter, SingleOutWriter},
    page_merge::{merge_task, PageMergeStats, TombstoneScope},
    validity::{ValidTimeCeiling, ValidityState},
    CompactionError,
};
use crate::{
    observability::log_debug,
    recency::RecencyPartition,
    relation::merge_doc_fields,
    segment::{to_merge_plan, MergePlanTask, PathFilter, Segment},
};

/// How a set of segments is merged.
#[derive(Clone, Debug, Default)]
pub struct SegmentMergeOptions {
    /// Split superseded rows into historical buckets; `None` writes a single
    /// relation.
    pub recency: Option<RecencyPartition>,
    /// Reach of the retained tombstone.
    pub tombstone_scope: TombstoneScope,
    /// Properties of the staged Parquet files.
    pub writer_props: Option<WriterProperties>,
}

/// Merge `segments` with the default [`ValidTimeCeiling`] oracle.
pub fn merge_segments(
    segments: &[Arc<dyn Segment>],
    filter: Option<&PathFilter>,
    options: &SegmentMergeOptions,
    cancel: &CancellationToken,
) -> Result<MergeResults, CompactionError> {
    merge_segments_with(segments, filter, options, &mut ValidTimeCeiling::new(), cancel)
}

/// Merge `segments` under `filter`, judging rows with `validity`.
///
/// Schemas are unified first; every planned task then becomes one staged
/// page per output relation.
pub fn merge_segments_with<V>(
    segments: &[Arc<dyn Segment>],
    filter: Option<&PathFilter>,
    options: &SegmentMergeOptions,
    validity: &mut V,
    cancel: &CancellationToken,
) -> Result<MergeResults, CompactionError>
where
    V: ValidityState + ?Sized,
{
    let schemas = segments
        .iter()
        .map(|segment| segment.schema().clone())
        .collect::<Vec<_>>();
    let schema = merge_doc_fields(&schemas)?;
    let tasks = to_merge_plan(segments, filter)?;

    let run = MergeRun {
        tasks: &tasks,
        filter,
        scope: options.tombstone_scope,
        cancel,
    };
    match options.recency {
        Some(partition) => run.drive(
            PartitionedOutWriter::new(&schema, options.writer_props.clone(), partition)?,
            &schema,
            validity,
        ),
        None => run.drive(
            SingleOutWriter::new(&schema, options.writer_props.clone())?,
            &schema,
            validity,
        ),
    }
}

struct MergeRun<'a> {
    tasks: &'a [MergePlanTask],
    filter: Option<&'a PathFilter>,
    scope: TombstoneScope,
    cancel: &'a CancellationToken,
}

impl MergeRun<'_> {
    fn drive<O, V>(
        &self,
        mut out: O,
        schema: &arrow::datatypes::SchemaRef,
        validity: &mut V,
    ) -> Result<MergeResults, CompactionError>
    where
        O: OutWriter,
        V: ValidityState + ?Sized,
    {
        let mut total = PageMergeStats::default();
        for task in self.tasks {
            let stats = merge_task(
                task,
                self.filter,
                schema,
                &mut out,
                validity,
                self.scope,
                self.cancel,
            )?;
            out.end_page(&PathFilter::effective_path(self.filter, &task.path))?;
            total.rows_in += stats.rows_in;
            total.rows_out += stats.rows_out;
        }
        log_debug!(
            "segment_merge",
            "segments_merged",
            tasks = self.tasks.len(),
            rows_in = total.rows_in,
            rows_out = total.rows_out,
        );
        out.end()
    }
}

/// Merge `segments` into one in-memory batch, ordered by iid then newest
/// system time first.
pub fn merge_to_relation(
    segments: &[Arc<dyn Segment>],
    filter: Option<&PathFilter>,
    tombstone_scope: TombstoneScope,
    cancel: &CancellationToken,
) -> Result<RecordBatch, CompactionError> {
    let options = SegmentMergeOptions {
        tombstone_scope,
        ..Default::default()
    };
    let results = merge_segments(segments, filter, &options, cancel)?;
    let mut pages = Vec::new();
    for result in results.results() {
        let reader = result.pages()?;
        for leaf in &result.leaves {
            pages.push(reader.read_page(leaf.page_idx)?);
        }
    }
    Ok(concat_batches(results.schema(), &pages)?)
}
