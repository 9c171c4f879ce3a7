//! Windowed grouped aggregation.
//!
//! Build combines records into per-partition partial aggregates keyed by
//! the group key. Probe merges the partials of every partition of every
//! slice in the window pairwise and emits one row per group:
//!
//! ```text
//! window_start | window_end | [key] | agg_1 | agg_2 | ...
//! ```
//!
//! Rows are ordered by key, null key first.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::{window_columns, window_fields, OperatorError, PartitionState};
use crate::slice::{Slice, WindowId};

/// Aggregate functions over `Int64` input columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// Number of rows (or non-null values when an input column is given)
    Count,
    /// Sum of non-null values
    Sum,
    /// Minimum non-null value
    Min,
    /// Maximum non-null value
    Max,
    /// Average of non-null values, as `Float64`
    Avg,
}

impl AggregateFunction {
    fn output_type(self) -> DataType {
        match self {
            Self::Avg => DataType::Float64,
            _ => DataType::Int64,
        }
    }
}

/// One aggregate of a window aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateExpr {
    /// Function to compute
    pub function: AggregateFunction,
    /// Input column name; `None` only for `COUNT(*)`
    pub input: Option<String>,
    /// Output column name
    pub output: String,
}

impl AggregateExpr {
    /// `COUNT(*)`
    #[must_use]
    pub fn count(output: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            input: None,
            output: output.into(),
        }
    }

    /// Aggregate of an input column.
    #[must_use]
    pub fn new(
        function: AggregateFunction,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            function,
            input: Some(input.into()),
            output: output.into(),
        }
    }

    /// `SUM(input)`
    #[must_use]
    pub fn sum(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Sum, input, output)
    }

    /// `MIN(input)`
    #[must_use]
    pub fn min(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Min, input, output)
    }

    /// `MAX(input)`
    #[must_use]
    pub fn max(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Max, input, output)
    }

    /// `AVG(input)`
    #[must_use]
    pub fn avg(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Avg, input, output)
    }
}

/// Partial state of one aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accumulator {
    Count(i64),
    Sum { sum: i64, count: u64 },
    Min(Option<i64>),
    Max(Option<i64>),
    Avg { sum: i64, count: u64 },
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::Sum => Self::Sum { sum: 0, count: 0 },
            AggregateFunction::Min => Self::Min(None),
            AggregateFunction::Max => Self::Max(None),
            AggregateFunction::Avg => Self::Avg { sum: 0, count: 0 },
        }
    }

    /// Adds one input value; `None` is a null.
    fn add(&mut self, value: Option<i64>) -> Result<(), OperatorError> {
        let Some(value) = value else {
            return Ok(());
        };
        match self {
            Self::Count(count) => *count += 1,
            Self::Sum { sum, count } | Self::Avg { sum, count } => {
                *sum = checked_sum(*sum, value)?;
                *count += 1;
            }
            Self::Min(min) => *min = Some(min.map_or(value, |m| m.min(value))),
            Self::Max(max) => *max = Some(max.map_or(value, |m| m.max(value))),
        }
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> Result<(), OperatorError> {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => *a += b,
            (Self::Sum { sum, count }, Self::Sum { sum: s, count: c })
            | (Self::Avg { sum, count }, Self::Avg { sum: s, count: c }) => {
                *sum = checked_sum(*sum, *s)?;
                *count += c;
            }
            (Self::Min(a), Self::Min(b)) => *a = min_opt(*a, *b),
            (Self::Max(a), Self::Max(b)) => *a = max_opt(*a, *b),
            // Accumulators of one group are always built from the same
            // aggregate list, position by position.
            _ => {}
        }
        Ok(())
    }

    fn int_result(&self) -> Option<i64> {
        match *self {
            Self::Count(count) => Some(count),
            Self::Sum { sum, count } => (count > 0).then_some(sum),
            Self::Min(value) | Self::Max(value) => value,
            Self::Avg { .. } => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn float_result(&self) -> Option<f64> {
        match *self {
            Self::Avg { sum, count } if count > 0 => Some(sum as f64 / count as f64),
            _ => None,
        }
    }
}

fn checked_sum(a: i64, b: i64) -> Result<i64, OperatorError> {
    a.checked_add(b).ok_or(OperatorError::Overflow("Int64 sum"))
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

type Accumulators = SmallVec<[Accumulator; 4]>;

/// Partial aggregates of one slice partition.
#[derive(Debug, Default)]
pub struct AggregationPartition {
    groups: FxHashMap<Option<i64>, Accumulators>,
    rows: u64,
}

impl AggregationPartition {
    /// Number of distinct groups.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Number of records combined into the partition.
    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.rows
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedAggregate {
    function: AggregateFunction,
    input: Option<usize>,
}

/// Grouped aggregation over tumbling or sliding windows.
#[derive(Debug)]
pub struct WindowAggregation {
    input_schema: SchemaRef,
    key: Option<usize>,
    aggregates: Vec<ResolvedAggregate>,
    output_schema: SchemaRef,
}

impl WindowAggregation {
    /// Resolves the key and aggregate columns against the input schema.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if no aggregates are given or
    /// a non-count aggregate has no input, and
    /// [`OperatorError::SchemaMismatch`] if a column is missing or not
    /// `Int64`.
    pub fn try_new(
        input_schema: SchemaRef,
        key: Option<&str>,
        aggregates: Vec<AggregateExpr>,
    ) -> Result<Self, OperatorError> {
        if aggregates.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "aggregation needs at least one aggregate".to_string(),
            ));
        }

        let mut fields: Vec<Field> = window_fields().into();
        let key = match key {
            Some(name) => {
                let index = int64_field(&input_schema, name)?;
                fields.push(Field::new(name, DataType::Int64, true));
                Some(index)
            }
            None => None,
        };

        let mut resolved = Vec::with_capacity(aggregates.len());
        for expr in &aggregates {
            let input = match (&expr.input, expr.function) {
                (Some(name), _) => Some(int64_field(&input_schema, name)?),
                (None, AggregateFunction::Count) => None,
                (None, function) => {
                    return Err(OperatorError::InvalidConfig(format!(
                        "{function:?} aggregate '{}' needs an input column",
                        expr.output
                    )))
                }
            };
            let nullable = expr.function != AggregateFunction::Count;
            fields.push(Field::new(
                &expr.output,
                expr.function.output_type(),
                nullable,
            ));
            resolved.push(ResolvedAggregate {
                function: expr.function,
                input,
            });
        }

        Ok(Self {
            input_schema,
            key,
            aggregates: resolved,
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    /// Expected input schema.
    #[must_use]
    pub fn input_schema(&self) -> SchemaRef {
        Arc::clone(&self.input_schema)
    }

    /// Schema of emitted batches.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    fn new_accumulators(&self) -> Accumulators {
        self.aggregates
            .iter()
            .map(|agg| Accumulator::new(agg.function))
            .collect()
    }

    /// Combines `rows` of `batch` into a partition.
    pub(crate) fn accumulate(
        &self,
        state: &mut AggregationPartition,
        batch: &RecordBatch,
        rows: &[u32],
    ) -> Result<(), OperatorError> {
        let key = self.key.map(|i| int64_column(batch, i)).transpose()?;
        let inputs = self
            .aggregates
            .iter()
            .map(|agg| agg.input.map(|i| int64_column(batch, i)).transpose())
            .collect::<Result<SmallVec<[Option<&Int64Array>; 4]>, _>>()?;

        for &row in rows {
            let row = row as usize;
            let group = key.and_then(|k| k.is_valid(row).then(|| k.value(row)));
            let accumulators = state
                .groups
                .entry(group)
                .or_insert_with(|| self.new_accumulators());
            for (acc, input) in accumulators.iter_mut().zip(&inputs) {
                let value = match input {
                    // COUNT(*) counts every row.
                    None => Some(1),
                    Some(column) => column.is_valid(row).then(|| column.value(row)),
                };
                acc.add(value)?;
            }
        }
        state.rows += rows.len() as u64;
        Ok(())
    }

    /// Merges every partition of the window's slices and builds the output.
    pub(crate) fn trigger_slices(
        &self,
        window: WindowId,
        slices: &[Arc<Slice<PartitionState>>],
    ) -> Result<Option<RecordBatch>, OperatorError> {
        let mut merged: FxHashMap<Option<i64>, Accumulators> = FxHashMap::default();
        for slice in slices {
            let mut failure = None;
            slice.for_each_partition(|partition| {
                if failure.is_some() {
                    return;
                }
                let result = match partition {
                    PartitionState::Aggregation(state) => merge_partition(&mut merged, state),
                    other => Err(OperatorError::MismatchedSliceShape {
                        operator: "aggregation",
                        partition: other.kind(),
                    }),
                };
                failure = result.err();
            });
            if let Some(err) = failure {
                return Err(err);
            }
        }

        if merged.is_empty() {
            return Ok(None);
        }

        let mut groups: Vec<_> = merged.into_iter().collect();
        groups.sort_unstable_by_key(|(group, _)| *group);

        let num_rows = groups.len();
        let mut columns: Vec<ArrayRef> = window_columns(window, num_rows).into();
        if self.key.is_some() {
            let keys: Int64Array = groups.iter().map(|(group, _)| *group).collect();
            columns.push(Arc::new(keys));
        }
        for (i, agg) in self.aggregates.iter().enumerate() {
            let column: ArrayRef = if agg.function == AggregateFunction::Avg {
                let values: Float64Array = groups.iter().map(|(_, accs)| accs[i].float_result()).collect();
                Arc::new(values)
            } else {
                let values: Int64Array = groups.iter().map(|(_, accs)| accs[i].int_result()).collect();
                Arc::new(values)
            };
            columns.push(column);
        }

        Ok(Some(RecordBatch::try_new(self.output_schema(), columns)?))
    }
}

fn merge_partition(
    merged: &mut FxHashMap<Option<i64>, Accumulators>,
    state: &AggregationPartition,
) -> Result<(), OperatorError> {
    for (group, partial) in &state.groups {
        match merged.entry(*group) {
            Entry::Occupied(mut entry) => {
                for (acc, other) in entry.get_mut().iter_mut().zip(partial) {
                    acc.merge(other)?;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(partial.clone());
            }
        }
    }
    Ok(())
}

fn int64_field(schema: &Schema, name: &str) -> Result<usize, OperatorError> {
    let index = schema
        .index_of(name)
        .map_err(|_| OperatorError::SchemaMismatch(format!("column '{name}' not found")))?;
    let data_type = schema.field(index).data_type();
    if *data_type != DataType::Int64 {
        return Err(OperatorError::SchemaMismatch(format!(
            "column '{name}' must be Int64, found {data_type}"
        )));
    }
    Ok(index)
}

pub(super) fn int64_column(batch: &RecordBatch, index: usize) -> Result<&Int64Array, OperatorError> {
    batch
        .columns()
        .get(index)
        .and_then(|column| column.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| {
            OperatorError::SchemaMismatch(format!("column {index} is missing or not Int64"))
        })
}
