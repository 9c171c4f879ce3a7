//! # Strata Core
//!
//! Window and slice state engine for streaming aggregations and joins.
//!
//! This crate provides:
//! - **Buffers**: Arrow record batches tagged with watermark, origin and
//!   sequence metadata
//! - **Time**: Event-time extraction and multi-origin watermark tracking
//! - **Slices**: Time-ranged partial state with per-worker partitions
//! - **Operators**: Windowed aggregation and join (build and probe)
//! - **Handler**: The build/probe protocol, triggering and lifecycle
//!
//! ## Design Principles
//!
//! 1. **No global lock on the hot path** - workers write to their own slice
//!    partition; only slice creation and triggering serialize
//! 2. **Exactly-once emission** - every window is probed at most once, in
//!    ascending end order
//! 3. **Explicit ownership** - the slice store owns slices until they are
//!    handed off to the probe and released
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arrow_array::{Int64Array, RecordBatch};
//! use strata_core::buffer::{BufferMetaData, OriginId, SequenceData, TupleBuffer};
//! use strata_core::config::{WindowOperatorConfig, WindowType};
//! use strata_core::handler::{HandlerId, PipelineContext, TerminationType, WindowBasedOperatorHandler};
//! use strata_core::operator::{AggregateExpr, AggregationBuild, WindowAggregation, WindowOperator};
//! use strata_core::testing::CollectingEmitter;
//! use strata_core::time::{TimestampColumn, TimestampFormat};
//!
//! let batch = RecordBatch::try_from_iter(vec![
//!     ("ts", Arc::new(Int64Array::from(vec![1, 5, 12])) as _),
//! ])
//! .unwrap();
//!
//! let origin = OriginId::new(1);
//! let config = WindowOperatorConfig::builder()
//!     .window(WindowType::tumbling(10))
//!     .left_origins([origin])
//!     .build()
//!     .unwrap();
//! let operator = WindowOperator::Aggregation(
//!     WindowAggregation::try_new(batch.schema(), None, vec![AggregateExpr::count("n")]).unwrap(),
//! );
//! let handler = Arc::new(WindowBasedOperatorHandler::try_new(HandlerId::new(1), config, operator).unwrap());
//!
//! let emitter = Arc::new(CollectingEmitter::new());
//! let ctx = PipelineContext::builder()
//!     .worker_threads(1)
//!     .emitter(emitter.clone())
//!     .handler(Arc::clone(&handler))
//!     .build()
//!     .unwrap();
//! handler.start(&ctx).unwrap();
//!
//! let build = AggregationBuild::new(
//!     HandlerId::new(1),
//!     TimestampColumn::from_column("ts", TimestampFormat::UnixMillis),
//! );
//! let meta = BufferMetaData::new(20, SequenceData::single(1), origin);
//! build.process_buffer(&ctx.worker(0), &TupleBuffer::new(batch, meta)).unwrap();
//!
//! // [0, 10) and [10, 20) are complete.
//! assert_eq!(emitter.buffers().len(), 2);
//! handler.stop(TerminationType::Graceful, &ctx).unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod config;
pub mod handler;
pub mod operator;
pub mod slice;
pub mod testing;
pub mod time;

// Re-export key types
pub use buffer::{BufferMetaData, OriginId, SequenceData, TupleBuffer};
pub use handler::{HandlerId, PipelineContext, TerminationType, WindowBasedOperatorHandler};

/// Result type for strata-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for strata-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator and handler errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Slice construction errors
    #[error("Slice error: {0}")]
    Slice(#[from] slice::SliceError),

    /// Watermark and sequence tracking errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Event-time extraction errors
    #[error("Event time error: {0}")]
    EventTime(#[from] time::EventTimeError),
}
