//! # Operator Module
//!
//! Window operators plug two hooks into the handler: a partition factory
//! that shapes the state of each new slice, and a trigger function that
//! merges a window's slices and produces its output.
//!
//! ## Operators
//!
//! - [`WindowAggregation`]: grouped `COUNT`/`SUM`/`MIN`/`MAX`/`AVG`
//! - [`WindowJoin`]: inner equi-join of two inputs within a window
//!
//! The set is closed: [`WindowOperator`] is an enum selected at construction
//! and its slice partitions are the matching [`PartitionState`] variant.
//!
//! ## Build
//!
//! [`AggregationBuild`] and [`JoinBuild`] are the per-buffer ingestion entry
//! points. They route each record to its slice, write it into the calling
//! worker's partition and report the buffer's metadata to the handler.

mod aggregation;
mod build;
mod join;

pub use aggregation::{
    AggregateExpr, AggregateFunction, AggregationPartition, WindowAggregation,
};
pub use build::{AggregationBuild, BuildStats, JoinBuild};
pub use join::{JoinPartition, WindowJoin};

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{ArrowError, SchemaRef};

use crate::buffer::TupleBuffer;
use crate::handler::{HandlerId, HandlerState};
use crate::slice::{PartitionFactory, Slice, SliceError, WindowId};
use crate::time::{EventTimeError, TimeError};

/// Input of a two-input operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSide {
    /// Left (or only) input
    Left,
    /// Right input of a join
    Right,
}

impl std::fmt::Display for InputSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// Downstream receiver of operator output.
///
/// Called inline from whichever worker thread triggered a window, so
/// implementations must be thread-safe and should not block for long.
pub trait Emitter: Send + Sync {
    /// Emits one output buffer. Each triggered window produces at most one.
    fn emit(&self, buffer: TupleBuffer);

    /// Emits records routed to a named side output (late data).
    ///
    /// The default implementation discards them.
    fn emit_side_output(&self, name: &str, batch: RecordBatch) {
        let _ = (name, batch);
    }
}

/// Errors raised by operators and their handler.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// No handler registered under the id.
    #[error("Unknown handler: {0}")]
    UnknownHandler(HandlerId),

    /// The handler is not accepting input.
    #[error("Handler {handler} is not running (state: {state})")]
    NotRunning {
        /// Handler id
        handler: HandlerId,
        /// State observed
        state: HandlerState,
    },

    /// A lifecycle call arrived in the wrong state.
    #[error("Handler {handler} cannot {action} from state {state}")]
    InvalidTransition {
        /// Handler id
        handler: HandlerId,
        /// Attempted action
        action: &'static str,
        /// State observed
        state: HandlerState,
    },

    /// A slice partition does not match the operator that reads it.
    #[error("Slice partition of kind {partition} handed to {operator} operator")]
    MismatchedSliceShape {
        /// Operator kind
        operator: &'static str,
        /// Partition kind
        partition: &'static str,
    },

    /// Input arrived on a side the operator does not have.
    #[error("Operator has no {0} input")]
    UnexpectedInput(InputSide),

    /// Input batch or operator definition does not fit the schema.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A batch or window side is too large to index rows with `u32`.
    #[error("{0} rows exceed the u32 row index range")]
    TooManyRows(usize),

    /// An aggregate left the range of its output type.
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    /// Invalid operator configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Arrow compute failure.
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// Watermark tracking failure.
    #[error("Time error: {0}")]
    Time(#[from] TimeError),

    /// Event-time extraction failure.
    #[error("Event time error: {0}")]
    EventTime(#[from] EventTimeError),

    /// Slice construction failure.
    #[error("Slice error: {0}")]
    Slice(#[from] SliceError),
}

/// State held by one slice partition.
#[derive(Debug)]
pub enum PartitionState {
    /// Partial aggregates keyed by group.
    Aggregation(AggregationPartition),
    /// Buffered rows of both join inputs.
    Join(JoinPartition),
}

impl PartitionState {
    /// Kind name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aggregation(_) => "aggregation",
            Self::Join(_) => "join",
        }
    }
}

/// The closed set of window operators.
#[derive(Debug)]
pub enum WindowOperator {
    /// Windowed grouped aggregation.
    Aggregation(WindowAggregation),
    /// Windowed inner equi-join.
    Join(WindowJoin),
}

impl WindowOperator {
    /// Kind name used in logs and error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aggregation(_) => "aggregation",
            Self::Join(_) => "join",
        }
    }

    /// Returns true if the operator has a right input.
    #[must_use]
    pub fn is_two_input(&self) -> bool {
        matches!(self, Self::Join(_))
    }

    /// Schema of emitted batches.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        match self {
            Self::Aggregation(agg) => agg.output_schema(),
            Self::Join(join) => join.output_schema(),
        }
    }

    /// Schema expected on an input.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::UnexpectedInput`] for a right input of an
    /// aggregation.
    pub fn input_schema(&self, side: InputSide) -> Result<SchemaRef, OperatorError> {
        match (self, side) {
            (Self::Aggregation(agg), InputSide::Left) => Ok(agg.input_schema()),
            (Self::Join(join), side) => Ok(join.input_schema(side)),
            (Self::Aggregation(_), InputSide::Right) => {
                Err(OperatorError::UnexpectedInput(InputSide::Right))
            }
        }
    }

    /// Creates the empty state of a new slice partition.
    #[must_use]
    pub fn create_partition(&self) -> PartitionState {
        match self {
            Self::Aggregation(_) => PartitionState::Aggregation(AggregationPartition::default()),
            Self::Join(_) => PartitionState::Join(JoinPartition::default()),
        }
    }

    /// Returns the partition factory the slice store uses for new slices.
    #[must_use]
    pub fn slice_factory(self: &Arc<Self>) -> PartitionFactory<PartitionState> {
        let operator = Arc::clone(self);
        Arc::new(move || operator.create_partition())
    }

    /// Writes `rows` of `batch` into a partition.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::MismatchedSliceShape`] if the partition was
    /// not created by this operator, [`OperatorError::UnexpectedInput`] for
    /// a right input of an aggregation, and Arrow errors from row selection.
    pub fn write(
        &self,
        partition: &mut PartitionState,
        side: InputSide,
        batch: &RecordBatch,
        rows: &[u32],
    ) -> Result<(), OperatorError> {
        match (self, partition) {
            (Self::Aggregation(agg), PartitionState::Aggregation(state)) => {
                if side == InputSide::Right {
                    return Err(OperatorError::UnexpectedInput(side));
                }
                agg.accumulate(state, batch, rows)
            }
            (Self::Join(join), PartitionState::Join(state)) => join.append(state, side, batch, rows),
            (operator, partition) => Err(OperatorError::MismatchedSliceShape {
                operator: operator.kind(),
                partition: partition.kind(),
            }),
        }
    }

    /// Merges the partitions of a window's slices and computes its output.
    ///
    /// Returns `None` when the window produced no rows.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::MismatchedSliceShape`] if a partition was not
    /// created by this operator, and Arrow errors from assembling the output.
    pub fn trigger_slices(
        &self,
        window: WindowId,
        slices: &[Arc<Slice<PartitionState>>],
    ) -> Result<Option<RecordBatch>, OperatorError> {
        match self {
            Self::Aggregation(agg) => agg.trigger_slices(window, slices),
            Self::Join(join) => join.trigger_slices(window, slices),
        }
    }
}

/// Checks a batch has the schema an input expects.
pub(crate) fn check_schema(expected: &SchemaRef, batch: &RecordBatch) -> Result<(), OperatorError> {
    let found = batch.schema_ref();
    if expected.fields() == found.fields() {
        Ok(())
    } else {
        Err(OperatorError::SchemaMismatch(format!(
            "expected fields {:?}, found {:?}",
            field_names(expected),
            field_names(found)
        )))
    }
}

fn field_names(schema: &SchemaRef) -> Vec<&str> {
    schema.fields().iter().map(|f| f.name().as_str()).collect()
}

/// Converts a row position to the `u32` index Arrow `take` uses.
pub(crate) fn row_index(row: usize) -> Result<u32, OperatorError> {
    u32::try_from(row).map_err(|_| OperatorError::TooManyRows(row))
}

/// Output columns shared by every window operator.
pub(crate) fn window_fields() -> [arrow_schema::Field; 2] {
    [
        arrow_schema::Field::new("window_start", arrow_schema::DataType::Int64, false),
        arrow_schema::Field::new("window_end", arrow_schema::DataType::Int64, false),
    ]
}

/// `window_start` and `window_end` columns for `num_rows` output rows.
pub(crate) fn window_columns(window: WindowId, num_rows: usize) -> [arrow_array::ArrayRef; 2] {
    [
        Arc::new(arrow_array::Int64Array::from(vec![window.start; num_rows])),
        Arc::new(arrow_array::Int64Array::from(vec![window.end; num_rows])),
    ]
}
