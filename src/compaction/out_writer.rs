//! Staging of merged rows into temporary data files.
//!
//! A merge first adds every contributing page as a source, then copies rows
//! by `(source, row)`. Ending a page materializes the buffered rows of each
//! output relation with one `interleave` per column and writes them as one
//! Parquet row group, recording the page's path and size as a [`PageLeaf`].

use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use arrow::{
    array::{Array, ArrayRef},
    compute::interleave,
    datatypes::SchemaRef,
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use chrono::NaiveDate;
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};
use tempfile::TempDir;

use super::{page_tree::PageLeaf, CompactionError};
use crate::{
    recency::RecencyPartition,
    trie::{write_row_group, PageReader, TriePath},
};

/// Index of a source page registered with [`OutWriter::add_source`].
pub type SourceId = usize;

const RECENCY_FMT: &str = "%Y%m%d";

/// Destination of merged rows.
pub trait OutWriter {
    /// Register a page rows will be copied from until the next page end.
    fn add_source(&mut self, page: RecordBatch) -> SourceId;

    /// Buffer `row` of `source`; `valid_to` picks the output relation.
    fn copy_row(&mut self, source: SourceId, row: usize, valid_to: i64);

    /// Flush buffered rows as one page per non-empty relation.
    fn end_page(&mut self, path: &TriePath) -> Result<(), CompactionError>;

    /// Close every relation and hand over the staged files.
    fn end(self) -> Result<MergeResults, CompactionError>
    where
        Self: Sized;
}

/// One staged relation: its file, recency bucket and page layout.
#[derive(Debug)]
pub struct MergeResult {
    /// Temporary data file; removed with the owning [`MergeResults`].
    pub data_path: PathBuf,
    /// Historical bucket, `None` for current rows.
    pub recency: Option<NaiveDate>,
    /// Pages in write order.
    pub leaves: Vec<PageLeaf>,
}

impl MergeResult {
    /// Read the staged data file.
    pub fn read_data(&self) -> Result<Bytes, CompactionError> {
        Ok(Bytes::from(fs::read(&self.data_path)?))
    }

    /// Open the staged data file for page reads.
    pub fn pages(&self) -> Result<PageReader<File>, CompactionError> {
        Ok(PageReader::try_new(File::open(&self.data_path)?)?)
    }

    /// Rows across all pages.
    pub fn row_count(&self) -> usize {
        self.leaves.iter().map(|leaf| leaf.row_count).sum()
    }
}

/// Everything a merge staged; the temporary directory lives as long as this.
#[derive(Debug)]
pub struct MergeResults {
    schema: SchemaRef,
    results: Vec<MergeResult>,
    _dir: TempDir,
}

impl MergeResults {
    /// Schema shared by all staged pages.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Staged relations: current first, then historical by date.
    pub fn results(&self) -> &[MergeResult] {
        &self.results
    }
}

fn temp_dir() -> Result<TempDir, CompactionError> {
    Ok(tempfile::Builder::new().prefix("compactor").tempdir()?)
}

struct OutRel {
    recency: Option<NaiveDate>,
    data_path: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
    rows: Vec<(SourceId, usize)>,
    leaves: Vec<PageLeaf>,
}

impl OutRel {
    fn create(
        dir: &Path,
        recency: Option<NaiveDate>,
        schema: &SchemaRef,
        props: Option<WriterProperties>,
    ) -> Result<Self, CompactionError> {
        let file_name = match recency {
            Some(date) => format!("r{}.parquet", date.format(RECENCY_FMT)),
            None => "rc.parquet".to_string(),
        };
        let data_path = dir.join(file_name);
        let writer = ArrowWriter::try_new(File::create(&data_path)?, schema.clone(), props)?;
        Ok(Self {
            recency,
            data_path,
            schema: schema.clone(),
            writer,
            rows: Vec::new(),
            leaves: Vec::new(),
        })
    }

    fn end_page(
        &mut self,
        sources: &[RecordBatch],
        path: &TriePath,
    ) -> Result<(), CompactionError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let columns = (0..self.schema.fields().len())
            .map(|col| {
                let arrays = sources
                    .iter()
                    .map(|page| page.column(col).as_ref())
                    .collect::<Vec<&dyn Array>>();
                interleave(&arrays, &self.rows)
            })
            .collect::<Result<Vec<ArrayRef>, ArrowError>>()?;
        let page = RecordBatch::try_new(self.schema.clone(), columns)?;

        let page_idx = write_row_group(&mut self.writer, &page)?;
        self.leaves.push(PageLeaf {
            page_idx,
            path: path.clone(),
            row_count: self.rows.len(),
        });
        self.rows.clear();
        Ok(())
    }

    fn finish(self) -> Result<MergeResult, CompactionError> {
        self.writer.close()?;
        Ok(MergeResult {
            data_path: self.data_path,
            recency: self.recency,
            leaves: self.leaves,
        })
    }
}

/// Writes every merged row into a single relation.
pub struct SingleOutWriter {
    dir: TempDir,
    sources: Vec<RecordBatch>,
    rel: OutRel,
}

impl SingleOutWriter {
    /// Stage pages of `schema` in a fresh temporary directory.
    pub fn new(
        schema: &SchemaRef,
        props: Option<WriterProperties>,
    ) -> Result<Self, CompactionError> {
        let dir = temp_dir()?;
        let rel = OutRel::create(dir.path(), None, schema, props)?;
        Ok(Self {
            dir,
            sources: Vec::new(),
            rel,
        })
    }
}

impl OutWriter for SingleOutWriter {
    fn add_source(&mut self, page: RecordBatch) -> SourceId {
        self.sources.push(page);
        self.sources.len() - 1
    }

    fn copy_row(&mut self, source: SourceId, row: usize, _valid_to: i64) {
        self.rel.rows.push((source, row));
    }

    fn end_page(&mut self, path: &TriePath) -> Result<(), CompactionError> {
        self.rel.end_page(&self.sources, path)?;
        self.sources.clear();
        Ok(())
    }

    fn end(self) -> Result<MergeResults, CompactionError> {
        let schema = self.rel.schema.clone();
        Ok(MergeResults {
            schema,
            results: vec![self.rel.finish()?],
            _dir: self.dir,
        })
    }
}

/// Routes rows into a current relation and per-bucket historical ones.
pub struct PartitionedOutWriter {
    dir: TempDir,
    schema: SchemaRef,
    props: Option<WriterProperties>,
    partition: RecencyPartition,
    sources: Vec<RecordBatch>,
    current: OutRel,
    historical: BTreeMap<NaiveDate, OutRel>,
    error: Option<CompactionError>,
}

impl PartitionedOutWriter {
    /// Stage pages of `schema`, bucketing superseded rows by `partition`.
    pub fn new(
        schema: &SchemaRef,
        props: Option<WriterProperties>,
        partition: RecencyPartition,
    ) -> Result<Self, CompactionError> {
        let dir = temp_dir()?;
        let current = OutRel::create(dir.path(), None, schema, props.clone())?;
        Ok(Self {
            dir,
            schema: schema.clone(),
            props,
            partition,
            sources: Vec::new(),
            current,
            historical: BTreeMap::new(),
            error: None,
        })
    }
}

impl OutWriter for PartitionedOutWriter {
    fn add_source(&mut self, page: RecordBatch) -> SourceId {
        self.sources.push(page);
        self.sources.len() - 1
    }

    fn copy_row(&mut self, source: SourceId, row: usize, valid_to: i64) {
        let Some(bucket) = self.partition.bucket_for(valid_to) else {
            self.current.rows.push((source, row));
            return;
        };
        if !self.historical.contains_key(&bucket) {
            match OutRel::create(self.dir.path(), Some(bucket), &self.schema, self.props.clone()) {
                Ok(rel) => {
                    self.historical.insert(bucket, rel);
                }
                Err(err) => {
                    // surfaced by the next end_page
                    self.error.get_or_insert(err);
                    return;
                }
            }
        }
        if let Some(rel) = self.historical.get_mut(&bucket) {
            rel.rows.push((source, row));
        }
    }

    fn end_page(&mut self, path: &TriePath) -> Result<(), CompactionError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        for rel in self.historical.values_mut() {
            rel.end_page(&self.sources, path)?;
        }
        self.current.end_page(&self.sources, path)?;
        self.sources.clear();
        Ok(())
    }

    fn end(self) -> Result<MergeResults, CompactionError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut results = Vec::with_capacity(self.historical.len() + 1);
        results.push(self.current.finish()?);
        for rel in self.historical.into_values() {
            results.push(rel.finish()?);
        }
        Ok(MergeResults {
            schema: self.schema,
            results,
            _dir: self.dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        recency::date_to_micros,
        relation::{EventColumns, EventRelationBuilder, END_OF_TIME},
        trie::{Iid, TrieError},
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn routes_rows_by_valid_to() {
        let mut builder = EventRelationBuilder::new("v");
        builder
            .put(Iid::from_u128(1), 3, 0, END_OF_TIME, "live")
            .put(Iid::from_u128(1), 2, 0, date_to_micros(date(2024, 1, 10)), "week2")
            .put(Iid::from_u128(1), 1, 0, date_to_micros(date(2024, 1, 3)), "week1");
        let page = builder.finish().expect("page");
        let schema = page.schema();

        let mut out =
            PartitionedOutWriter::new(&schema, None, RecencyPartition::Week).expect("writer");
        let source = out.add_source(page.clone());
        let events = EventColumns::try_new(&page).expect("columns");
        for row in 0..page.num_rows() {
            out.copy_row(source, row, events.valid_to(row));
        }
        out.end_page(&TriePath::from_nibbles([0])).expect("end page");
        // nothing buffered: no empty pages
        out.end_page(&TriePath::from_nibbles([1])).expect("end page");

        let results = out.end().expect("end");
        let summary = results
            .results()
            .iter()
            .map(|r| (r.recency, r.row_count(), r.leaves.len()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (None, 1, 1),
                (Some(date(2024, 1, 8)), 1, 1),
                (Some(date(2024, 1, 15)), 1, 1),
            ]
        );

        let current = &results.results()[0];
        let staged = current.pages().expect("pages").read_page(0).expect("page");
        assert_eq!(
            EventColumns::try_new(&staged).expect("columns").system_from(0),
            3
        );
        assert_eq!(current.leaves[0].path, TriePath::from_nibbles([0]));
    }

    #[test]
    fn temp_files_go_away_with_results() {
        let page = EventRelationBuilder::new("v").finish().expect("page");
        let out = SingleOutWriter::new(&page.schema(), None).expect("writer");
        let results = out.end().expect("end");
        let path = results.results()[0].data_path.clone();
        assert!(path.exists());
        drop(results);
        assert!(!path.exists());
    }

    #[test]
    fn page_split_across_row_groups_fails() {
        let mut builder = EventRelationBuilder::new("v");
        for n in 0..4u128 {
            builder.put(Iid::from_u128(n), 1, 0, END_OF_TIME, "v");
        }
        let page = builder.finish().expect("page");
        let props = WriterProperties::builder().set_max_row_group_size(2).build();

        let mut out = SingleOutWriter::new(&page.schema(), Some(props)).expect("writer");
        let source = out.add_source(page.clone());
        for row in 0..page.num_rows() {
            out.copy_row(source, row, END_OF_TIME);
        }
        assert!(matches!(
            out.end_page(&TriePath::root()),
            Err(CompactionError::Trie(TrieError::SplitPage {
                rows: 4,
                row_groups: 2
            }))
        ));
    }
}
