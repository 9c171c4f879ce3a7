//! # Window-Based Operator Handler
//!
//! Orchestrates the build/probe protocol of one window operator instance.
//!
//! ## Protocol
//!
//! 1. Build resolves each record's slice in the [`SliceStore`] and writes it
//!    into the calling worker's partition.
//! 2. At the end of every buffer, build reports the buffer's
//!    [`BufferMetaData`] to [`check_and_trigger_windows`].
//! 3. The handler advances the watermark processor of that input. If the
//!    safe watermark (minimum over every origin of every input) moved, it
//!    seals the slices no open window needs, probes every window with
//!    `end <= safe` in ascending order and emits the results.
//! 4. Slices below the earliest open window are removed from the store and
//!    released.
//!
//! Step 3 runs under one mutex per handler: it is the only serialization
//! point. Whichever worker wins the lock triggers the newly safe windows;
//! others observe them as already triggered.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --start--> Started --first buffer--> Running --stop--> Stopping --> Stopped
//!                                                    |
//!                                              write/trigger error --> Failed --stop--> Stopped
//! ```
//!
//! A graceful stop flushes every remaining window regardless of watermark.
//! A hard stop releases all slices without probing them: their data is lost.
//! A failed handler rejects further input; stopping it discards its slices.
//!
//! [`check_and_trigger_windows`]: WindowBasedOperatorHandler::check_and_trigger_windows

mod context;
mod metrics;

#[cfg(test)]
mod tests;

pub use context::{
    HandlerId, HandlerRegistry, PipelineContext, PipelineContextBuilder, WorkerContext,
};
pub use metrics::{HandlerMetrics, HandlerMetricsSnapshot};

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::sync::Arc;

use arrow::compute::take_record_batch;
use arrow_array::{RecordBatch, UInt32Array};
use arrow_schema::SchemaRef;
use parking_lot::Mutex;

use crate::buffer::{BufferMetaData, SequenceData, TupleBuffer};
use crate::config::WindowOperatorConfig;
use crate::operator::{Emitter, InputSide, OperatorError, PartitionState, WindowOperator};
use crate::slice::{SliceAssigner, SliceStore};
use crate::time::{MultiOriginWatermarkProcessor, Watermark};

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Constructed, no state allocated
    Created = 0,
    /// Slice store allocated, no buffer reported yet
    Started = 1,
    /// Processing buffers
    Running = 2,
    /// Stop in progress
    Stopping = 3,
    /// Stopped; all state released
    Stopped = 4,
    /// A write or trigger failed; input is rejected until stopped
    Failed = 5,
}

impl HandlerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Running,
            3 => Self::Stopping,
            5 => Self::Failed,
            _ => Self::Stopped,
        }
    }

    /// Returns true if build input is accepted.
    #[must_use]
    pub fn is_accepting_input(self) -> bool {
        matches!(self, Self::Started | Self::Running)
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How an operator instance is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// Soft stop: flush every pending window, then release state.
    Graceful,
    /// Hard stop: release state without flushing. Pending windows are lost.
    Hard,
}

/// Watermark and trigger progress, guarded by the handler's trigger lock.
#[derive(Debug)]
struct TriggerState {
    left: MultiOriginWatermarkProcessor,
    right: Option<MultiOriginWatermarkProcessor>,
    /// Every window with `end <= last_trigger_watermark` has been triggered.
    last_trigger_watermark: i64,
    next_output_sequence: u64,
}

impl TriggerState {
    fn safe_watermark(&self) -> Watermark {
        let left = self.left.current_min_watermark();
        match &self.right {
            Some(right) => left.min(right.current_min_watermark()),
            None => left,
        }
    }
}

/// Drives slicing, triggering and emission for one window operator.
///
/// Shared by all workers of a pipeline through the [`HandlerRegistry`].
pub struct WindowBasedOperatorHandler {
    id: HandlerId,
    config: WindowOperatorConfig,
    operator: Arc<WindowOperator>,
    state: AtomicU8,
    store: OnceLock<SliceStore<PartitionState>>,
    trigger: Mutex<TriggerState>,
    metrics: HandlerMetrics,
}

impl WindowBasedOperatorHandler {
    /// Creates a handler in the [`HandlerState::Created`] state.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if the configuration is
    /// invalid, a join has no right origins, or an aggregation has some.
    pub fn try_new(
        id: HandlerId,
        config: WindowOperatorConfig,
        operator: WindowOperator,
    ) -> Result<Self, OperatorError> {
        config.validate()?;
        match (operator.is_two_input(), config.right_origins.is_empty()) {
            (true, true) => {
                return Err(OperatorError::InvalidConfig(
                    "join needs right input origins".to_string(),
                ))
            }
            (false, false) => {
                return Err(OperatorError::InvalidConfig(format!(
                    "{} operator has no right input",
                    operator.kind()
                )))
            }
            _ => {}
        }

        let trigger = TriggerState {
            left: MultiOriginWatermarkProcessor::new(config.left_origins.iter().copied()),
            right: operator
                .is_two_input()
                .then(|| MultiOriginWatermarkProcessor::new(config.right_origins.iter().copied())),
            last_trigger_watermark: i64::MIN,
            next_output_sequence: 1,
        };

        Ok(Self {
            id,
            config,
            operator: Arc::new(operator),
            state: AtomicU8::new(HandlerState::Created as u8),
            store: OnceLock::new(),
            trigger: Mutex::new(trigger),
            metrics: HandlerMetrics::new(),
        })
    }

    /// Handler id.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Operator configuration.
    #[must_use]
    pub fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    /// The window operator driven by this handler.
    #[must_use]
    pub fn operator(&self) -> &WindowOperator {
        &self.operator
    }

    /// Schema of emitted buffers.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        self.operator.output_schema()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Allocates the slice store and registers the pipeline's worker count.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidTransition`] unless the handler is in
    /// the [`HandlerState::Created`] state.
    pub fn start(&self, ctx: &PipelineContext) -> Result<(), OperatorError> {
        let state = self.state();
        if state != HandlerState::Created {
            return Err(OperatorError::InvalidTransition {
                handler: self.id,
                action: "start",
                state,
            });
        }

        let num_partitions = self
            .config
            .num_partitions
            .unwrap_or_else(|| ctx.num_worker_threads());
        let store = SliceStore::new(
            SliceAssigner::for_window(&self.config.window),
            num_partitions,
            self.operator.slice_factory(),
        )?;
        if self.store.set(store).is_err() {
            return Err(OperatorError::InvalidTransition {
                handler: self.id,
                action: "start",
                state: self.state(),
            });
        }
        self.set_state(HandlerState::Started);

        tracing::info!(
            handler = %self.id,
            operator = self.operator.kind(),
            window = ?self.config.window,
            partitions = num_partitions,
            "handler started"
        );
        Ok(())
    }

    /// Slice store, if the handler accepts input.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotRunning`] before `start` and after `stop`.
    pub fn slice_store(&self) -> Result<&SliceStore<PartitionState>, OperatorError> {
        let state = self.state();
        if !state.is_accepting_input() {
            return Err(OperatorError::NotRunning {
                handler: self.id,
                state,
            });
        }
        self.store.get().ok_or(OperatorError::NotRunning {
            handler: self.id,
            state,
        })
    }

    /// Advances the watermark of one input with a processed buffer's
    /// metadata and emits every window that became complete.
    ///
    /// Returns the number of buffers emitted. Duplicate or stale metadata is
    /// a no-op; no window is ever probed twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is not running, the side or origin is
    /// unknown, the sequence data is invalid, or probing fails.
    pub fn check_and_trigger_windows(
        &self,
        side: InputSide,
        meta: &BufferMetaData,
        ctx: &PipelineContext,
    ) -> Result<usize, OperatorError> {
        let store = self.slice_store()?;
        let mut trigger = self.trigger.lock();

        match self.state() {
            HandlerState::Started => {
                // Losing this race to another worker is fine.
                let _ = self.state.compare_exchange(
                    HandlerState::Started as u8,
                    HandlerState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            HandlerState::Running => {}
            state @ HandlerState::Failed => {
                return Err(OperatorError::NotRunning {
                    handler: self.id,
                    state,
                })
            }
            // A stop acquired the lock first and has already flushed or
            // discarded everything.
            _ => return Ok(0),
        }

        let processor = match side {
            InputSide::Left => &mut trigger.left,
            InputSide::Right => trigger
                .right
                .as_mut()
                .ok_or(OperatorError::UnexpectedInput(side))?,
        };
        processor.update(meta)?;
        self.metrics.record_buffer();

        let safe = trigger.safe_watermark().timestamp();
        tracing::trace!(
            handler = %self.id,
            %side,
            origin = %meta.origin(),
            sequence = %meta.sequence(),
            watermark = meta.watermark(),
            safe,
            "watermark update"
        );
        if safe <= trigger.last_trigger_watermark {
            return Ok(0);
        }
        self.trigger_windows(&mut trigger, store, safe, ctx.emitter(), false)
            .inspect_err(|err| self.fail(err))
    }

    /// Flushes every outstanding window regardless of watermark, then
    /// releases all slices. Used by a graceful stop.
    ///
    /// Returns the number of buffers emitted.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotRunning`] before `start`, or an error
    /// from probing.
    pub fn trigger_all_windows(&self, ctx: &PipelineContext) -> Result<usize, OperatorError> {
        let store = self.store.get().ok_or(OperatorError::NotRunning {
            handler: self.id,
            state: self.state(),
        })?;
        let mut trigger = self.trigger.lock();
        let emitted = self.trigger_windows(&mut trigger, store, i64::MAX, ctx.emitter(), true)?;
        let remaining = store.drain_all();
        self.metrics.record_released(remaining.len());
        tracing::debug!(handler = %self.id, emitted, "flushed all windows");
        Ok(emitted)
    }

    /// Probes and emits every window with `last < end <= up_to`, then
    /// releases slices no open window needs.
    fn trigger_windows(
        &self,
        trigger: &mut TriggerState,
        store: &SliceStore<PartitionState>,
        up_to: i64,
        emitter: &dyn Emitter,
        flush: bool,
    ) -> Result<usize, OperatorError> {
        // Seal first: slices created after this point for a triggered range
        // resolve as late instead of being silently released unprobed.
        let threshold = store.advance_trigger_watermark(up_to);
        let windows = store.windows_to_trigger(trigger.last_trigger_watermark, up_to);

        let mut emitted = 0;
        for window in windows {
            let slices = store.slices_for_window(window);
            self.metrics.record_window(flush);
            let output = self.operator.trigger_slices(window, &slices)?;
            tracing::debug!(
                handler = %self.id,
                %window,
                slices = slices.len(),
                rows = output.as_ref().map_or(0, RecordBatch::num_rows),
                flush,
                "triggered window"
            );

            if let Some(batch) = output {
                let sequence = trigger.next_output_sequence;
                trigger.next_output_sequence += 1;
                self.metrics.record_output(batch.num_rows());
                let meta = BufferMetaData::new(
                    window.end,
                    SequenceData::single(sequence),
                    self.config.output_origin,
                );
                emitter.emit(TupleBuffer::new(batch, meta));
                emitted += 1;
            }
            // Windows come in ascending end order.
            trigger.last_trigger_watermark = window.end;
        }
        trigger.last_trigger_watermark = up_to;

        let released = store.remove_slices_below(threshold);
        self.metrics.record_released(released.len());
        Ok(emitted)
    }

    /// Applies the late-data policy to `rows` of `batch`.
    ///
    /// # Errors
    ///
    /// Returns Arrow errors from selecting the rows for the side output.
    pub(crate) fn handle_late_records(
        &self,
        batch: &RecordBatch,
        rows: &[u32],
        emitter: &dyn Emitter,
    ) -> Result<(), OperatorError> {
        match self.config.late_data.side_output() {
            Some(name) => {
                let late = take_record_batch(batch, &UInt32Array::from(rows.to_vec()))?;
                emitter.emit_side_output(name, late);
                self.metrics.record_late(rows.len(), true);
            }
            None => self.metrics.record_late(rows.len(), false),
        }
        tracing::debug!(
            handler = %self.id,
            late = rows.len(),
            side_output = ?self.config.late_data.side_output(),
            "late records"
        );
        Ok(())
    }

    /// Moves a running handler to [`HandlerState::Failed`].
    ///
    /// Called when a slice write or a window trigger fails: the windows after
    /// the failure can no longer be emitted correctly, so no further input
    /// is accepted.
    pub(crate) fn fail(&self, err: &OperatorError) {
        let failed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                HandlerState::from_u8(raw)
                    .is_accepting_input()
                    .then_some(HandlerState::Failed as u8)
            })
            .is_ok();
        if failed {
            tracing::error!(handler = %self.id, error = %err, "handler failed");
        }
    }

    /// Stops the handler.
    ///
    /// [`TerminationType::Graceful`] emits every pending window first;
    /// [`TerminationType::Hard`] discards them. Stopping twice is a no-op.
    /// Workers must have stopped submitting buffers.
    ///
    /// # Errors
    ///
    /// Returns an error from probing during a graceful flush. The handler is
    /// stopped either way.
    pub fn stop(
        &self,
        termination: TerminationType,
        ctx: &PipelineContext,
    ) -> Result<(), OperatorError> {
        let transition = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match HandlerState::from_u8(raw) {
                    HandlerState::Created => Some(HandlerState::Stopped as u8),
                    HandlerState::Started | HandlerState::Running | HandlerState::Failed => {
                        Some(HandlerState::Stopping as u8)
                    }
                    HandlerState::Stopping | HandlerState::Stopped => None,
                }
            });
        let previous = match transition {
            Ok(raw) => HandlerState::from_u8(raw),
            Err(_) => return Ok(()),
        };
        if previous == HandlerState::Created {
            tracing::info!(handler = %self.id, "handler stopped before start");
            return Ok(());
        }

        let result = match termination {
            // A failed handler cannot flush correctly; its slices are dropped.
            _ if previous == HandlerState::Failed => {
                self.discard_all();
                Ok(())
            }
            TerminationType::Graceful => self.trigger_all_windows(ctx).map(|_| ()),
            TerminationType::Hard => {
                self.discard_all();
                Ok(())
            }
        };
        self.set_state(HandlerState::Stopped);
        tracing::info!(handler = %self.id, ?termination, "handler stopped");
        result
    }

    fn discard_all(&self) {
        let Some(store) = self.store.get() else {
            return;
        };
        let _trigger = self.trigger.lock();
        let discarded = store.drain_all();
        self.metrics.record_discarded(discarded.len());
        if !discarded.is_empty() {
            tracing::warn!(
                handler = %self.id,
                slices = discarded.len(),
                "discarded unflushed slices"
            );
        }
    }

    /// Safe watermark: minimum over every origin of every input.
    #[must_use]
    pub fn safe_watermark(&self) -> Watermark {
        self.trigger.lock().safe_watermark()
    }

    /// Watermark up to which every window has been triggered.
    #[must_use]
    pub fn last_trigger_watermark(&self) -> Watermark {
        Watermark::new(self.trigger.lock().last_trigger_watermark)
    }

    /// Number of slices currently retained.
    #[must_use]
    pub fn num_slices(&self) -> usize {
        self.store.get().map_or(0, SliceStore::len)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> HandlerMetricsSnapshot {
        self.metrics
            .snapshot(self.store.get().map_or(0, SliceStore::slices_created))
    }
}

impl fmt::Debug for WindowBasedOperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowBasedOperatorHandler")
            .field("id", &self.id)
            .field("operator", &self.operator.kind())
            .field("state", &self.state())
            .field("store", &self.store.get())
            .finish_non_exhaustive()
    }
}
