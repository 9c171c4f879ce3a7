//! # Buffers and Buffer Metadata
//!
//! Record batches flow between pipeline stages as [`TupleBuffer`]s: an Arrow
//! [`RecordBatch`] plus the [`BufferMetaData`] that the watermark processor
//! needs to decide when event time has progressed.
//!
//! ## Ordering
//!
//! Every buffer produced by an origin carries a [`SequenceData`] triple. A
//! logical unit of work has one sequence number and may be split into several
//! chunks; the last chunk is flagged so the receiver knows how many to expect.
//!
//! ```rust
//! use strata_core::buffer::{BufferMetaData, OriginId, SequenceData};
//!
//! // Sequence 3 was split in two chunks, this is the second (final) one.
//! let meta = BufferMetaData::new(1_000, SequenceData::new(3, 2, true), OriginId::new(7));
//! assert_eq!(meta.watermark(), 1_000);
//! assert!(meta.sequence().is_last_chunk());
//! ```

use std::fmt;

use arrow_array::RecordBatch;

/// Identifier of one upstream source or partition feeding an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OriginId(pub u64);

impl OriginId {
    /// Creates a new origin identifier.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// Position of a buffer within the output of one origin.
///
/// Sequence and chunk numbers are 1-based. `(seq, chunk, last)` totally
/// orders buffers of one origin: sequence `n` is complete once its last chunk
/// and every chunk before it have been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceData {
    sequence_number: u64,
    chunk_number: u64,
    last_chunk: bool,
}

impl SequenceData {
    /// Creates sequence data for a chunk.
    #[inline]
    #[must_use]
    pub const fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Sequence data for an unchunked buffer (`chunk = 1`, last chunk).
    #[inline]
    #[must_use]
    pub const fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, 1, true)
    }

    /// Returns the sequence number.
    #[inline]
    #[must_use]
    pub const fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Returns the chunk number within the sequence.
    #[inline]
    #[must_use]
    pub const fn chunk_number(&self) -> u64 {
        self.chunk_number
    }

    /// Returns true if this is the final chunk of its sequence.
    #[inline]
    #[must_use]
    pub const fn is_last_chunk(&self) -> bool {
        self.last_chunk
    }
}

impl fmt::Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}",
            self.sequence_number,
            self.chunk_number,
            if self.last_chunk { "$" } else { "" }
        )
    }
}

/// Metadata reported by the build phase once a buffer has been processed.
///
/// Immutable once created; the handler consumes it to advance watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferMetaData {
    watermark: i64,
    sequence: SequenceData,
    origin: OriginId,
}

impl BufferMetaData {
    /// Creates buffer metadata.
    #[inline]
    #[must_use]
    pub const fn new(watermark: i64, sequence: SequenceData, origin: OriginId) -> Self {
        Self {
            watermark,
            sequence,
            origin,
        }
    }

    /// Watermark timestamp (milliseconds) carried by the buffer.
    #[inline]
    #[must_use]
    pub const fn watermark(&self) -> i64 {
        self.watermark
    }

    /// Sequence position of the buffer within its origin.
    #[inline]
    #[must_use]
    pub const fn sequence(&self) -> SequenceData {
        self.sequence
    }

    /// Origin that produced the buffer.
    #[inline]
    #[must_use]
    pub const fn origin(&self) -> OriginId {
        self.origin
    }
}

/// A batch of records together with its metadata.
#[derive(Debug, Clone)]
pub struct TupleBuffer {
    /// Record payload.
    pub data: RecordBatch,
    /// Watermark, sequence and origin of the payload.
    pub meta: BufferMetaData,
}

impl TupleBuffer {
    /// Creates a new buffer.
    #[must_use]
    pub fn new(data: RecordBatch, meta: BufferMetaData) -> Self {
        Self { data, meta }
    }

    /// Number of records in the buffer.
    #[inline]
    #[must_use]
    pub fn num_records(&self) -> usize {
        self.data.num_rows()
    }

    /// Watermark carried by the buffer.
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.meta.watermark()
    }

    /// Origin of the buffer.
    #[inline]
    #[must_use]
    pub fn origin(&self) -> OriginId {
        self.meta.origin()
    }

    /// Sequence position of the buffer.
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> SequenceData {
        self.meta.sequence()
    }
}
