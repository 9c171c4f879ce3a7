//! Build side: per-buffer ingestion into slice partitions.

use std::collections::BTreeMap;

use arrow_array::RecordBatch;

use super::{check_schema, row_index, InputSide, OperatorError};
use crate::buffer::{BufferMetaData, TupleBuffer};
use crate::handler::{HandlerId, WindowBasedOperatorHandler, WorkerContext};
use crate::slice::SliceLookup;
use crate::time::TimestampColumn;

/// Outcome of building one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Records written into slice partitions
    pub records_written: usize,
    /// Records that arrived after all their windows were emitted
    pub late_records: usize,
    /// Windows emitted by the buffer-close check
    pub windows_emitted: usize,
}

/// Shared build path of aggregation and join inputs.
#[derive(Debug, Clone)]
struct BuildInput {
    handler: HandlerId,
    side: InputSide,
    timestamp: TimestampColumn,
}

impl BuildInput {
    fn execute(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        let handler = ctx.handler(self.handler)?;
        write_batch(&handler, ctx, self.side, &self.timestamp, &buffer.data)
    }

    fn close(&self, ctx: &WorkerContext<'_>, meta: &BufferMetaData) -> Result<usize, OperatorError> {
        ctx.handler(self.handler)?
            .check_and_trigger_windows(self.side, meta, ctx.pipeline())
    }

    fn process_buffer(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        let mut stats = self.execute(ctx, buffer)?;
        stats.windows_emitted = self.close(ctx, &buffer.meta)?;
        Ok(stats)
    }
}

/// Routes records to their slices and writes them into the worker's
/// partition. Late records are handed to the handler's late-data policy.
fn write_batch(
    handler: &WindowBasedOperatorHandler,
    ctx: &WorkerContext<'_>,
    side: InputSide,
    timestamp: &TimestampColumn,
    batch: &RecordBatch,
) -> Result<BuildStats, OperatorError> {
    let store = handler.slice_store()?;
    let operator = handler.operator();
    check_schema(&operator.input_schema(side)?, batch)?;
    let timestamps = timestamp.timestamps(batch)?;

    // slice start -> (a timestamp inside the slice, rows)
    let assigner = store.assigner();
    let mut groups: BTreeMap<i64, (i64, Vec<u32>)> = BTreeMap::new();
    for (row, &ts) in timestamps.iter().enumerate() {
        let slice = assigner.slice_for(ts);
        groups
            .entry(slice.start)
            .or_insert_with(|| (ts, Vec::new()))
            .1
            .push(row_index(row)?);
    }

    let mut stats = BuildStats::default();
    let mut late_rows = Vec::new();
    for (ts, rows) in groups.into_values() {
        match store.get_or_create_slice(ts)? {
            SliceLookup::Slice(slice) => {
                let written = slice.write(ctx.worker_id(), |partition| {
                    operator.write(partition, side, batch, &rows)
                });
                match written {
                    Some(result) => {
                        result.inspect_err(|err| handler.fail(err))?;
                        stats.records_written += rows.len();
                    }
                    // Sealed between lookup and write.
                    None => late_rows.extend(rows),
                }
            }
            SliceLookup::Late => late_rows.extend(rows),
        }
    }

    if !late_rows.is_empty() {
        late_rows.sort_unstable();
        stats.late_records = late_rows.len();
        handler.handle_late_records(batch, &late_rows, ctx.pipeline().emitter())?;
    }

    tracing::trace!(
        handler = %handler.id(),
        worker = ctx.worker_id(),
        %side,
        written = stats.records_written,
        late = stats.late_records,
        "built buffer"
    );
    Ok(stats)
}

/// Build entry point of a window aggregation.
///
/// One instance per pipeline stage, shared by all workers.
#[derive(Debug, Clone)]
pub struct AggregationBuild {
    input: BuildInput,
}

impl AggregationBuild {
    /// Creates a build operator feeding the handler registered as `handler`.
    #[must_use]
    pub fn new(handler: HandlerId, timestamp: TimestampColumn) -> Self {
        Self {
            input: BuildInput {
                handler,
                side: InputSide::Left,
                timestamp,
            },
        }
    }

    /// Combines every record of the buffer into the worker's partition of
    /// its slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or not running, the batch
    /// does not match the input schema, or a timestamp is missing.
    pub fn execute(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        self.input.execute(ctx, buffer)
    }

    /// Reports a processed buffer to the handler and emits every window the
    /// report completes. Returns the number of windows emitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or the metadata is invalid.
    pub fn close(&self, ctx: &WorkerContext<'_>, meta: &BufferMetaData) -> Result<usize, OperatorError> {
        self.input.close(ctx, meta)
    }

    /// [`execute`](Self::execute) followed by [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute) and [`close`](Self::close).
    pub fn process_buffer(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        self.input.process_buffer(ctx, buffer)
    }
}

/// Build entry point of one input of a window join.
#[derive(Debug, Clone)]
pub struct JoinBuild {
    input: BuildInput,
}

impl JoinBuild {
    /// Creates a build operator for one join input.
    #[must_use]
    pub fn new(handler: HandlerId, side: InputSide, timestamp: TimestampColumn) -> Self {
        Self {
            input: BuildInput {
                handler,
                side,
                timestamp,
            },
        }
    }

    /// Input this build operator feeds.
    #[must_use]
    pub fn side(&self) -> InputSide {
        self.input.side
    }

    /// Appends every record of the buffer to the worker's partition of its
    /// slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or not running, the batch
    /// does not match the input schema, or a timestamp is missing.
    pub fn execute(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        self.input.execute(ctx, buffer)
    }

    /// Reports a processed buffer of this input to the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or the metadata is invalid.
    pub fn close(&self, ctx: &WorkerContext<'_>, meta: &BufferMetaData) -> Result<usize, OperatorError> {
        self.input.close(ctx, meta)
    }

    /// [`execute`](Self::execute) followed by [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute) and [`close`](Self::close).
    pub fn process_buffer(
        &self,
        ctx: &WorkerContext<'_>,
        buffer: &TupleBuffer,
    ) -> Result<BuildStats, OperatorError> {
        self.input.process_buffer(ctx, buffer)
    }
}
