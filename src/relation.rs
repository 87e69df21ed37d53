//! The bitemporal event relation stored in trie data pages.
//!
//! Every page is an Arrow batch with the fixed event columns (`_iid`,
//! `_system_from`, `_valid_from`, `_valid_to`, `op`) plus a nullable `doc`
//! struct carrying the put payload. Pages written at different times may
//! disagree on the children of `doc`; [`merge_doc_fields`] and
//! [`align_batch`] bring them onto one schema before rows are combined.

use std::sync::Arc;

use arrow::{
    array::{
        new_null_array, Array, ArrayRef, FixedSizeBinaryArray, Int8Array, StringArray,
        StructArray, TimestampMicrosecondArray, UInt32Array,
    },
    buffer::{Buffer, NullBuffer},
    compute::{cast, take_record_batch},
    datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};

use crate::trie::{Iid, TrieError, IID_LEN};

/// Entity identifier column.
pub const IID: &str = "_iid";
/// Transaction (system) time the version was recorded.
pub const SYSTEM_FROM: &str = "_system_from";
/// Inclusive lower valid-time bound.
pub const VALID_FROM: &str = "_valid_from";
/// Exclusive upper valid-time bound.
pub const VALID_TO: &str = "_valid_to";
/// Event operation, see [`Op`].
pub const OP: &str = "op";
/// Put payload.
pub const DOC: &str = "doc";

/// Micros value standing for an unbounded timestamp.
pub const END_OF_TIME: i64 = i64::MAX;
/// Micros value standing for the beginning of time.
pub const START_OF_TIME: i64 = i64::MIN;

/// Kind of change an event row records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Op {
    /// New document version over the row's valid-time interval.
    Put = 0,
    /// Removes the entity over the row's valid-time interval.
    Delete = 1,
    /// Removes every trace of the entity.
    Erase = 2,
}

impl TryFrom<i8> for Op {
    type Error = TrieError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Op::Put),
            1 => Ok(Op::Delete),
            2 => Ok(Op::Erase),
            other => Err(TrieError::UnknownOp(other)),
        }
    }
}

/// `Timestamp(µs, UTC)`, the type of every temporal column.
pub fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Event schema whose `doc` struct has the given children.
pub fn event_schema(doc_fields: Fields) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(IID, DataType::FixedSizeBinary(IID_LEN as i32), false),
        Field::new(SYSTEM_FROM, timestamp_type(), false),
        Field::new(VALID_FROM, timestamp_type(), false),
        Field::new(VALID_TO, timestamp_type(), false),
        Field::new(OP, DataType::Int8, false),
        Field::new(DOC, DataType::Struct(doc_fields), true),
    ]))
}

fn doc_children(schema: &Schema) -> Fields {
    match schema.field_with_name(DOC).map(|field| field.data_type()) {
        Ok(DataType::Struct(children)) => children.clone(),
        _ => Fields::empty(),
    }
}

/// Unify several event schemas into one.
///
/// The `doc` children are unioned in first-seen order; a child absent from
/// any input becomes nullable. A child present with two different types is
/// rejected.
pub fn merge_doc_fields(schemas: &[SchemaRef]) -> Result<SchemaRef, TrieError> {
    let mut merged: Vec<Field> = Vec::new();
    let mut seen_in: Vec<usize> = Vec::new();

    for schema in schemas {
        for child in doc_children(schema).iter() {
            match merged.iter().position(|field| field.name() == child.name()) {
                Some(pos) => {
                    if merged[pos].data_type() != child.data_type() {
                        return Err(TrieError::IncompatibleSchema(format!(
                            "doc field `{}` is both {} and {}",
                            child.name(),
                            merged[pos].data_type(),
                            child.data_type()
                        )));
                    }
                    if child.is_nullable() && !merged[pos].is_nullable() {
                        merged[pos] = merged[pos].clone().with_nullable(true);
                    }
                    seen_in[pos] += 1;
                }
                None => {
                    merged.push(child.as_ref().clone());
                    seen_in.push(1);
                }
            }
        }
    }

    let fields = merged
        .into_iter()
        .zip(seen_in)
        .map(|(field, seen)| {
            if seen < schemas.len() {
                field.with_nullable(true)
            } else {
                field
            }
        })
        .collect::<Fields>();

    Ok(event_schema(fields))
}

/// Reshape `batch` onto `target`, filling absent columns with nulls.
pub fn align_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch, TrieError> {
    if batch.schema().as_ref() == target.as_ref() {
        return Ok(batch.clone());
    }
    let columns = target
        .fields()
        .iter()
        .map(|field| align_column(batch.column_by_name(field.name()), field, batch.num_rows()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

fn align_column(
    column: Option<&ArrayRef>,
    field: &FieldRef,
    len: usize,
) -> Result<ArrayRef, TrieError> {
    let Some(column) = column else {
        return Ok(new_null_array(field.data_type(), len));
    };
    if column.data_type() == field.data_type() {
        return Ok(column.clone());
    }
    match (column.data_type(), field.data_type()) {
        (DataType::Struct(_), DataType::Struct(children)) => {
            let source = column
                .as_any()
                .downcast_ref::<StructArray>()
                .ok_or(TrieError::MissingColumn(DOC))?;
            let arrays = children
                .iter()
                .map(|child| align_column(source.column_by_name(child.name()), child, len))
                .collect::<Result<Vec<_>, _>>()?;
            let aligned =
                StructArray::try_new(children.clone(), arrays, source.nulls().cloned())?;
            Ok(Arc::new(aligned))
        }
        (_, data_type) => Ok(cast(column, data_type)?),
    }
}

/// Copy the rows at `indices` into a new batch.
pub fn take_rows(batch: &RecordBatch, indices: &[u32]) -> Result<RecordBatch, TrieError> {
    let indices = UInt32Array::from(indices.to_vec());
    Ok(take_record_batch(batch, &indices)?)
}

/// Typed views over the fixed event columns of one batch.
#[derive(Clone, Debug)]
pub struct EventColumns {
    iid: FixedSizeBinaryArray,
    system_from: TimestampMicrosecondArray,
    valid_from: TimestampMicrosecondArray,
    valid_to: TimestampMicrosecondArray,
    op: Int8Array,
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &'static str,
) -> Result<&'a T, TrieError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
        .ok_or(TrieError::MissingColumn(name))
}

impl EventColumns {
    /// Resolve the event columns of `batch`.
    pub fn try_new(batch: &RecordBatch) -> Result<Self, TrieError> {
        Ok(Self {
            iid: column::<FixedSizeBinaryArray>(batch, IID)?.clone(),
            system_from: column::<TimestampMicrosecondArray>(batch, SYSTEM_FROM)?.clone(),
            valid_from: column::<TimestampMicrosecondArray>(batch, VALID_FROM)?.clone(),
            valid_to: column::<TimestampMicrosecondArray>(batch, VALID_TO)?.clone(),
            op: column::<Int8Array>(batch, OP)?.clone(),
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.iid.len()
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.iid.is_empty()
    }

    /// Raw iid bytes of `row`.
    pub fn iid(&self, row: usize) -> &[u8] {
        self.iid.value(row)
    }

    /// `_system_from` micros of `row`.
    pub fn system_from(&self, row: usize) -> i64 {
        self.system_from.value(row)
    }

    /// `_valid_from` micros of `row`.
    pub fn valid_from(&self, row: usize) -> i64 {
        self.valid_from.value(row)
    }

    /// `_valid_to` micros of `row`.
    pub fn valid_to(&self, row: usize) -> i64 {
        self.valid_to.value(row)
    }

    /// Decoded operation of `row`.
    pub fn op(&self, row: usize) -> Result<Op, TrieError> {
        Op::try_from(self.op.value(row))
    }
}

/// Builder for event relations whose `doc` carries one string field.
///
/// Meant for level-0 ingestion and fixtures; real documents come from the
/// write path with arbitrary `doc` shapes.
#[derive(Debug)]
pub struct EventRelationBuilder {
    doc_field: String,
    iid: Vec<u8>,
    system_from: Vec<i64>,
    valid_from: Vec<i64>,
    valid_to: Vec<i64>,
    op: Vec<i8>,
    doc: Vec<Option<String>>,
}

impl EventRelationBuilder {
    /// Start an empty relation whose `doc` struct has one Utf8 child.
    pub fn new(doc_field: impl Into<String>) -> Self {
        Self {
            doc_field: doc_field.into(),
            iid: Vec::new(),
            system_from: Vec::new(),
            valid_from: Vec::new(),
            valid_to: Vec::new(),
            op: Vec::new(),
            doc: Vec::new(),
        }
    }

    fn push(
        &mut self,
        iid: Iid,
        system_from: i64,
        valid_from: i64,
        valid_to: i64,
        op: Op,
        doc: Option<String>,
    ) -> &mut Self {
        self.iid.extend_from_slice(iid.as_bytes());
        self.system_from.push(system_from);
        self.valid_from.push(valid_from);
        self.valid_to.push(valid_to);
        self.op.push(op as i8);
        self.doc.push(doc);
        self
    }

    /// Record a put of `value` over `[valid_from, valid_to)`.
    pub fn put(
        &mut self,
        iid: Iid,
        system_from: i64,
        valid_from: i64,
        valid_to: i64,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(
            iid,
            system_from,
            valid_from,
            valid_to,
            Op::Put,
            Some(value.into()),
        )
    }

    /// Record a delete over `[valid_from, valid_to)`.
    pub fn delete(
        &mut self,
        iid: Iid,
        system_from: i64,
        valid_from: i64,
        valid_to: i64,
    ) -> &mut Self {
        self.push(iid, system_from, valid_from, valid_to, Op::Delete, None)
    }

    /// Record an erase of the whole entity.
    pub fn erase(&mut self, iid: Iid, system_from: i64) -> &mut Self {
        self.push(
            iid,
            system_from,
            START_OF_TIME,
            END_OF_TIME,
            Op::Erase,
            None,
        )
    }

    /// Number of rows recorded so far.
    pub fn len(&self) -> usize {
        self.op.len()
    }

    /// Whether no rows were recorded.
    pub fn is_empty(&self) -> bool {
        self.op.is_empty()
    }

    /// Build the batch, rows in insertion order.
    pub fn finish(self) -> Result<RecordBatch, TrieError> {
        let doc_fields = Fields::from(vec![Field::new(&self.doc_field, DataType::Utf8, true)]);
        let schema = event_schema(doc_fields.clone());

        let doc_nulls = NullBuffer::from(self.doc.iter().map(Option::is_some).collect::<Vec<_>>());
        let doc_values: ArrayRef = Arc::new(StringArray::from(self.doc));
        let doc = StructArray::try_new(doc_fields, vec![doc_values], Some(doc_nulls))?;

        let columns: Vec<ArrayRef> = vec![
            Arc::new(FixedSizeBinaryArray::new(
                IID_LEN as i32,
                Buffer::from_vec(self.iid),
                None,
            )),
            Arc::new(TimestampMicrosecondArray::from(self.system_from).with_timezone("UTC")),
            Arc::new(TimestampMicrosecondArray::from(self.valid_from).with_timezone("UTC")),
            Arc::new(TimestampMicrosecondArray::from(self.valid_to).with_timezone("UTC")),
            Arc::new(Int8Array::from(self.op)),
            Arc::new(doc),
        ];
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::DataType;

    use super::*;

    fn doc_schema(children: Vec<Field>) -> SchemaRef {
        event_schema(Fields::from(children))
    }

    #[test]
    fn builder_produces_event_columns() {
        let mut builder = EventRelationBuilder::new("name");
        builder
            .put(Iid::from_u128(1), 10, 0, END_OF_TIME, "a")
            .delete(Iid::from_u128(1), 20, 5, END_OF_TIME)
            .erase(Iid::from_u128(2), 30);
        let batch = builder.finish().expect("batch");
        assert_eq!(batch.num_rows(), 3);

        let events = EventColumns::try_new(&batch).expect("columns");
        assert_eq!(events.op(0).expect("op"), Op::Put);
        assert_eq!(events.op(1).expect("op"), Op::Delete);
        assert_eq!(events.op(2).expect("op"), Op::Erase);
        assert_eq!(events.valid_from(2), START_OF_TIME);
        assert_eq!(events.iid(2), Iid::from_u128(2).as_bytes());

        let doc = batch.column_by_name(DOC).expect("doc");
        assert!(doc.is_valid(0));
        assert!(doc.is_null(1));
    }

    #[test]
    fn merged_doc_fields_become_nullable_when_missing() {
        let left = doc_schema(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("age", DataType::Int64, false),
        ]);
        let right = doc_schema(vec![Field::new("name", DataType::Utf8, false)]);

        let merged = merge_doc_fields(&[left, right]).expect("merge");
        let DataType::Struct(children) = merged.field_with_name(DOC).expect("doc").data_type()
        else {
            panic!("doc is not a struct");
        };
        assert_eq!(children.len(), 2);
        assert!(!children[0].is_nullable());
        assert_eq!(children[1].name(), "age");
        assert!(children[1].is_nullable());
    }

    #[test]
    fn conflicting_doc_types_are_rejected() {
        let left = doc_schema(vec![Field::new("name", DataType::Utf8, true)]);
        let right = doc_schema(vec![Field::new("name", DataType::Int64, true)]);
        assert!(matches!(
            merge_doc_fields(&[left, right]),
            Err(TrieError::IncompatibleSchema(_))
        ));
    }

    #[test]
    fn align_fills_missing_doc_children_with_nulls() {
        let mut builder = EventRelationBuilder::new("name");
        builder.put(Iid::from_u128(7), 1, 0, END_OF_TIME, "x");
        let batch = builder.finish().expect("batch");

        let target = merge_doc_fields(&[
            batch.schema(),
            doc_schema(vec![Field::new("age", DataType::Int64, true)]),
        ])
        .expect("merge");
        let aligned = align_batch(&batch, &target).expect("align");
        assert_eq!(aligned.schema(), target);

        let doc = aligned
            .column_by_name(DOC)
            .and_then(|doc| doc.as_any().downcast_ref::<StructArray>())
            .expect("doc struct");
        assert!(doc.column_by_name("age").expect("age").is_null(0));
        let name = doc
            .column_by_name("name")
            .and_then(|name| name.as_any().downcast_ref::<StringArray>())
            .expect("name");
        assert_eq!(name.value(0), "x");
    }

    #[test]
    fn take_rows_keeps_requested_order() {
        let mut builder = EventRelationBuilder::new("name");
        for i in 0..4u128 {
            builder.put(Iid::from_u128(i), i as i64, 0, END_OF_TIME, format!("v{i}"));
        }
        let batch = builder.finish().expect("batch");
        let taken = take_rows(&batch, &[3, 1]).expect("take");
        let events = EventColumns::try_new(&taken).expect("columns");
        assert_eq!(events.len(), 2);
        assert_eq!(events.system_from(0), 3);
        assert_eq!(events.system_from(1), 1);
    }
}
