//! # Multi-Origin Watermark Processing
//!
//! Tracks watermarks per origin and the minimum across all of them. That
//! minimum is the *safe* watermark: no origin will deliver records older
//! than it.
//!
//! ## Sequence Completeness
//!
//! Buffers may arrive out of network order. An origin's watermark only
//! advances through sequence number `n` once every sequence `1..=n` has been
//! observed completely (all chunks up to and including the last one):
//!
//! ```text
//! origin A:  seq 1 (wm 10) ✓   seq 3 (wm 30) ✓   seq 2 missing
//!            watermark(A) = 10      ← seq 3 is parked until seq 2 arrives
//!
//! seq 2 (wm 20) arrives:
//!            watermark(A) = 30      ← 1, 2, 3 contiguous
//! ```
//!
//! ## Regression Handling
//!
//! A completed sequence carrying a lower watermark than the origin's current
//! one never moves the origin backwards; the value is clamped and counted.
//!
//! ## Thread Safety
//!
//! The processor is not internally synchronized. The operator handler owns it
//! behind its trigger lock, which is the single serialization point for
//! watermark updates.

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::{TimeError, Watermark};
use crate::buffer::{BufferMetaData, OriginId, SequenceData};

/// Counters describing the processor's behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatermarkProcessorMetrics {
    /// Chunks that were already observed (or belong to an already completed
    /// sequence) and were ignored
    pub duplicate_chunks: u64,
    /// Completed sequences whose watermark was below the origin's current one
    pub clamped_regressions: u64,
    /// Sequences that completed and were folded into an origin's watermark
    pub completed_sequences: u64,
}

/// Snapshot of one origin's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginProgress {
    /// Watermark through the last contiguous completed sequence
    pub watermark: Watermark,
    /// Next sequence number required to advance
    pub next_sequence: u64,
    /// Sequences received but not yet contiguous or not yet complete
    pub pending_sequences: usize,
}

/// Chunks received so far for one sequence number.
#[derive(Debug)]
struct PendingSequence {
    chunks: SmallVec<[u64; 4]>,
    last_chunk: Option<u64>,
    watermark: i64,
}

impl PendingSequence {
    fn new() -> Self {
        Self {
            chunks: SmallVec::new(),
            last_chunk: None,
            watermark: i64::MIN,
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.last_chunk, Some(last) if self.chunks.len() as u64 == last)
    }
}

/// Per-origin sequencing state.
#[derive(Debug)]
struct OriginSequencer {
    watermark: i64,
    next_sequence: u64,
    pending: BTreeMap<u64, PendingSequence>,
}

impl OriginSequencer {
    fn new() -> Self {
        Self {
            watermark: i64::MIN,
            next_sequence: 1,
            pending: BTreeMap::new(),
        }
    }
}

/// Tracks the maximum watermark per origin and the minimum across origins.
///
/// Origins are fixed at construction. Until every origin has completed its
/// first sequence the combined watermark stays at `i64::MIN`, so a slow
/// starting origin can never be skipped.
///
/// # Example
///
/// ```rust
/// use strata_core::buffer::{BufferMetaData, OriginId, SequenceData};
/// use strata_core::time::{MultiOriginWatermarkProcessor, Watermark};
///
/// let origin = OriginId::new(0);
/// let mut processor = MultiOriginWatermarkProcessor::new([origin]);
///
/// // Sequence 2 first: parked, sequence 1 is still missing.
/// let wm = processor.update(&BufferMetaData::new(20, SequenceData::single(2), origin)).unwrap();
/// assert!(wm.is_unset());
///
/// let wm = processor.update(&BufferMetaData::new(10, SequenceData::single(1), origin)).unwrap();
/// assert_eq!(wm, Watermark::new(20));
/// ```
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: FxHashMap<OriginId, OriginSequencer>,
    combined_watermark: i64,
    metrics: WatermarkProcessorMetrics,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor tracking the given origins.
    #[must_use]
    pub fn new(origins: impl IntoIterator<Item = OriginId>) -> Self {
        let origins: FxHashMap<_, _> = origins
            .into_iter()
            .map(|origin| (origin, OriginSequencer::new()))
            .collect();
        Self {
            origins,
            combined_watermark: i64::MIN,
            metrics: WatermarkProcessorMetrics::default(),
        }
    }

    /// Records the watermark of a processed buffer.
    ///
    /// Returns the combined (minimum) watermark after the update.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownOrigin`] if the origin was not registered,
    /// [`TimeError::InvalidSequence`] for zero sequence or chunk numbers and
    /// [`TimeError::ConflictingLastChunk`] if chunk numbering of a sequence is
    /// inconsistent.
    pub fn update(&mut self, meta: &BufferMetaData) -> Result<Watermark, TimeError> {
        self.update_watermark(meta.origin(), meta.watermark(), meta.sequence())
    }

    /// Records a watermark for `origin` at the given sequence position.
    ///
    /// # Errors
    ///
    /// See [`MultiOriginWatermarkProcessor::update`].
    pub fn update_watermark(
        &mut self,
        origin: OriginId,
        watermark: i64,
        sequence: SequenceData,
    ) -> Result<Watermark, TimeError> {
        let state = self
            .origins
            .get_mut(&origin)
            .ok_or(TimeError::UnknownOrigin(origin))?;

        let seq = sequence.sequence_number();
        let chunk = sequence.chunk_number();
        if seq == 0 || chunk == 0 {
            return Err(TimeError::InvalidSequence { origin, sequence });
        }

        if seq < state.next_sequence {
            self.metrics.duplicate_chunks += 1;
            return Ok(self.current_min_watermark());
        }

        let pending = state.pending.entry(seq).or_insert_with(PendingSequence::new);
        if pending.chunks.contains(&chunk) {
            self.metrics.duplicate_chunks += 1;
            return Ok(self.current_min_watermark());
        }

        let conflicting = if sequence.is_last_chunk() {
            pending.last_chunk.is_some_and(|last| last != chunk)
                || pending.chunks.iter().any(|&c| c > chunk)
        } else {
            pending.last_chunk.is_some_and(|last| chunk >= last)
        };
        if conflicting {
            return Err(TimeError::ConflictingLastChunk { origin, sequence });
        }

        pending.chunks.push(chunk);
        pending.watermark = pending.watermark.max(watermark);
        if sequence.is_last_chunk() {
            pending.last_chunk = Some(chunk);
        }

        while state
            .pending
            .get(&state.next_sequence)
            .is_some_and(PendingSequence::is_complete)
        {
            let Some(done) = state.pending.remove(&state.next_sequence) else {
                break;
            };
            if done.watermark < state.watermark {
                self.metrics.clamped_regressions += 1;
                tracing::warn!(
                    %origin,
                    sequence = state.next_sequence,
                    current = state.watermark,
                    reported = done.watermark,
                    "watermark regression clamped"
                );
            }
            state.watermark = state.watermark.max(done.watermark);
            state.next_sequence += 1;
            self.metrics.completed_sequences += 1;
        }

        self.recompute_combined();
        tracing::trace!(
            %origin,
            %sequence,
            watermark,
            combined = self.combined_watermark,
            "watermark updated"
        );
        Ok(self.current_min_watermark())
    }

    /// Returns the minimum watermark across all origins.
    ///
    /// `Watermark::default()` (i.e. `i64::MIN`) while any origin has not yet
    /// completed its first sequence, or if no origins are tracked.
    #[must_use]
    pub fn current_min_watermark(&self) -> Watermark {
        Watermark::new(self.combined_watermark)
    }

    /// Returns the watermark of one origin, if it is tracked.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<Watermark> {
        self.origins.get(&origin).map(|s| Watermark::new(s.watermark))
    }

    /// Returns a progress snapshot for one origin.
    #[must_use]
    pub fn progress(&self, origin: OriginId) -> Option<OriginProgress> {
        self.origins.get(&origin).map(|s| OriginProgress {
            watermark: Watermark::new(s.watermark),
            next_sequence: s.next_sequence,
            pending_sequences: s.pending.len(),
        })
    }

    /// Returns true if `origin` is tracked by this processor.
    #[must_use]
    pub fn contains(&self, origin: OriginId) -> bool {
        self.origins.contains_key(&origin)
    }

    /// Returns the number of tracked origins.
    #[must_use]
    pub fn num_origins(&self) -> usize {
        self.origins.len()
    }

    /// Returns the processor counters.
    #[must_use]
    pub fn metrics(&self) -> &WatermarkProcessorMetrics {
        &self.metrics
    }

    fn recompute_combined(&mut self) {
        let min = self
            .origins
            .values()
            .map(|s| s.watermark)
            .min()
            .unwrap_or(i64::MIN);
        // Every origin is monotone, so the minimum is too.
        debug_assert!(min >= self.combined_watermark);
        self.combined_watermark = min;
    }
}
