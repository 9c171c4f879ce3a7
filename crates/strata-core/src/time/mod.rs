//! # Time Module
//!
//! Event time, watermarks, and per-origin progress tracking.
//!
//! ## Concepts
//!
//! - **Event Time**: Timestamp carried by each record, read from a column of
//!   the record batch (see [`TimestampColumn`])
//! - **Watermark**: Assertion that no records with timestamp < watermark will
//!   arrive from an origin
//! - **Safe Watermark**: Minimum watermark across every origin of an input;
//!   windows ending at or before it are complete
//!
//! ## Multi-Origin Tracking
//!
//! ```rust
//! use strata_core::buffer::{BufferMetaData, OriginId, SequenceData};
//! use strata_core::time::{MultiOriginWatermarkProcessor, Watermark};
//!
//! let a = OriginId::new(1);
//! let b = OriginId::new(2);
//! let mut processor = MultiOriginWatermarkProcessor::new([a, b]);
//!
//! processor.update(&BufferMetaData::new(25, SequenceData::single(1), a)).unwrap();
//! // Origin b has not reported yet, nothing is safe.
//! assert_eq!(processor.current_min_watermark(), Watermark::default());
//!
//! processor.update(&BufferMetaData::new(5, SequenceData::single(1), b)).unwrap();
//! assert_eq!(processor.current_min_watermark(), Watermark::new(5));
//! ```

mod event_time;
mod multi_origin;

pub use event_time::{EventTimeError, TimestampColumn, TimestampField, TimestampFormat};
pub use multi_origin::{MultiOriginWatermarkProcessor, OriginProgress, WatermarkProcessorMetrics};

use crate::buffer::{OriginId, SequenceData};

/// A watermark indicating event time progress.
///
/// Watermarks are monotonically increasing assertions that no records with
/// timestamps earlier than the watermark will arrive. The default watermark
/// is `i64::MIN`, meaning no progress has been made yet.
///
/// # Example
///
/// ```rust
/// use strata_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
///
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// assert!(!watermark.is_late(1001));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Returns true if no progress has been recorded.
    #[inline]
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.0 == i64::MIN
    }

    /// Checks if a record is late relative to this watermark.
    ///
    /// A record is late if its timestamp is strictly less than the watermark.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns the minimum (earlier) of two watermarks.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self(i64::MIN)
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// Errors that can occur in time operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    /// Buffer metadata names an origin that was never registered.
    #[error("Unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// Sequence or chunk number outside the 1-based range.
    #[error("Invalid sequence data {sequence} from {origin}")]
    InvalidSequence {
        /// Origin that reported the sequence
        origin: OriginId,
        /// Offending sequence data
        sequence: SequenceData,
    },

    /// A chunk arrived after a different chunk of the same sequence was
    /// flagged as the last one.
    #[error("Conflicting last chunk for sequence {sequence} from {origin}")]
    ConflictingLastChunk {
        /// Origin that reported the sequence
        origin: OriginId,
        /// Offending sequence data
        sequence: SequenceData,
    },
}
