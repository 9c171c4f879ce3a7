//! Windowed inner equi-join.
//!
//! Build appends the rows of each input to the worker's partition as-is.
//! Probe concatenates each side over all partitions of the window's slices,
//! hashes the right side by key and streams the left side against it.
//!
//! Output:
//!
//! ```text
//! window_start | window_end | left_<field>... | right_<field>...
//! ```
//!
//! Null keys never match.

use std::sync::Arc;

use arrow::compute::{concat_batches, take_record_batch};
use arrow_array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::aggregation::int64_column;
use super::{
    row_index, window_columns, window_fields, InputSide, OperatorError, PartitionState,
};
use crate::slice::{Slice, WindowId};

/// Buffered rows of one slice partition, per input.
#[derive(Debug, Default)]
pub struct JoinPartition {
    left: Vec<RecordBatch>,
    right: Vec<RecordBatch>,
}

impl JoinPartition {
    /// Number of buffered rows on a side.
    #[must_use]
    pub fn num_rows(&self, side: InputSide) -> usize {
        self.side(side).iter().map(RecordBatch::num_rows).sum()
    }

    fn side(&self, side: InputSide) -> &[RecordBatch] {
        match side {
            InputSide::Left => &self.left,
            InputSide::Right => &self.right,
        }
    }

    fn side_mut(&mut self, side: InputSide) -> &mut Vec<RecordBatch> {
        match side {
            InputSide::Left => &mut self.left,
            InputSide::Right => &mut self.right,
        }
    }
}

/// Inner equi-join of two inputs within tumbling or sliding windows.
#[derive(Debug)]
pub struct WindowJoin {
    left_schema: SchemaRef,
    right_schema: SchemaRef,
    left_key: usize,
    right_key: usize,
    output_schema: SchemaRef,
}

impl WindowJoin {
    /// Resolves the `Int64` key columns of both inputs.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::SchemaMismatch`] if a key column is missing
    /// or not `Int64`.
    pub fn try_new(
        left_schema: SchemaRef,
        right_schema: SchemaRef,
        left_key: &str,
        right_key: &str,
    ) -> Result<Self, OperatorError> {
        let left_key = key_index(&left_schema, left_key)?;
        let right_key = key_index(&right_schema, right_key)?;

        let mut fields: Vec<Field> = window_fields().into();
        for (prefix, schema) in [("left", &left_schema), ("right", &right_schema)] {
            fields.extend(schema.fields().iter().map(|field| {
                Field::new(
                    format!("{prefix}_{}", field.name()),
                    field.data_type().clone(),
                    field.is_nullable(),
                )
            }));
        }

        Ok(Self {
            left_schema,
            right_schema,
            left_key,
            right_key,
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    /// Expected schema of an input.
    #[must_use]
    pub fn input_schema(&self, side: InputSide) -> SchemaRef {
        match side {
            InputSide::Left => Arc::clone(&self.left_schema),
            InputSide::Right => Arc::clone(&self.right_schema),
        }
    }

    /// Schema of emitted batches.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Appends `rows` of `batch` to one side of a partition.
    pub(crate) fn append(
        &self,
        state: &mut JoinPartition,
        side: InputSide,
        batch: &RecordBatch,
        rows: &[u32],
    ) -> Result<(), OperatorError> {
        if rows.is_empty() {
            return Ok(());
        }
        let selected = if rows.len() == batch.num_rows() {
            batch.clone()
        } else {
            take_record_batch(batch, &UInt32Array::from(rows.to_vec()))?
        };
        state.side_mut(side).push(selected);
        Ok(())
    }

    /// Joins both sides of every partition of the window's slices.
    pub(crate) fn trigger_slices(
        &self,
        window: WindowId,
        slices: &[Arc<Slice<PartitionState>>],
    ) -> Result<Option<RecordBatch>, OperatorError> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for slice in slices {
            let mut mismatch = None;
            slice.for_each_partition(|partition| match partition {
                PartitionState::Join(state) => {
                    left.extend(state.left.iter().cloned());
                    right.extend(state.right.iter().cloned());
                }
                other => mismatch = Some(other.kind()),
            });
            if let Some(partition) = mismatch {
                return Err(OperatorError::MismatchedSliceShape {
                    operator: "join",
                    partition,
                });
            }
        }

        if left.is_empty() || right.is_empty() {
            return Ok(None);
        }
        let left = concat_batches(&self.left_schema, &left)?;
        let right = concat_batches(&self.right_schema, &right)?;

        let right_keys = int64_column(&right, self.right_key)?;
        let mut table: FxHashMap<i64, SmallVec<[u32; 2]>> = FxHashMap::default();
        for row in 0..right.num_rows() {
            if right_keys.is_valid(row) {
                table
                    .entry(right_keys.value(row))
                    .or_default()
                    .push(row_index(row)?);
            }
        }

        let left_keys = int64_column(&left, self.left_key)?;
        let mut left_rows = Vec::new();
        let mut right_rows = Vec::new();
        for row in 0..left.num_rows() {
            if !left_keys.is_valid(row) {
                continue;
            }
            if let Some(matches) = table.get(&left_keys.value(row)) {
                let left_row = row_index(row)?;
                for &right_row in matches {
                    left_rows.push(left_row);
                    right_rows.push(right_row);
                }
            }
        }

        if left_rows.is_empty() {
            return Ok(None);
        }

        let num_rows = left_rows.len();
        let left = take_record_batch(&left, &UInt32Array::from(left_rows))?;
        let right = take_record_batch(&right, &UInt32Array::from(right_rows))?;

        let mut columns: Vec<ArrayRef> = window_columns(window, num_rows).into();
        columns.extend(left.columns().iter().cloned());
        columns.extend(right.columns().iter().cloned());
        Ok(Some(RecordBatch::try_new(self.output_schema(), columns)?))
    }
}

fn key_index(schema: &Schema, name: &str) -> Result<usize, OperatorError> {
    let index = schema
        .index_of(name)
        .map_err(|_| OperatorError::SchemaMismatch(format!("join key '{name}' not found")))?;
    let data_type = schema.field(index).data_type();
    if *data_type != DataType::Int64 {
        return Err(OperatorError::SchemaMismatch(format!(
            "join key '{name}' must be Int64, found {data_type}"
        )));
    }
    Ok(index)
}
