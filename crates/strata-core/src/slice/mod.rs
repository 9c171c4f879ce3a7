//! # Slices
//!
//! A slice is the unit of partial window state: one `[start, end)` interval
//! of event time, holding one partition per worker slot. Windows are
//! assembled from the slices they cover.
//!
//! ## Slicing
//!
//! Slice boundaries are every window start and every window end. Tumbling
//! windows therefore map to exactly one slice each; overlapping sliding
//! windows share slices:
//!
//! ```text
//! size 10, slide 4
//! windows: ... [-4,6) [0,10) [4,14) [8,18) ...
//! starts:  0 4 8 12 ...
//! ends:    2 6 10 14 ...
//! slices:  [0,2) [2,4) [4,6) [6,8) [8,10) ...
//! ```
//!
//! ## Partitions
//!
//! Every slice has a fixed number of partitions. A worker writes to
//! partition `worker_id % num_partitions`, created lazily on first write.
//! With at least as many partitions as workers no two workers ever touch the
//! same partition, so the per-partition lock is uncontended on the hot path.
//!
//! ## Sealing
//!
//! Once the safe watermark passes a slice's end the slice is sealed. Writes
//! that observe the seal are rejected and treated as late data; the probe
//! phase only reads sealed slices, so a slice is never mutated after it has
//! been handed off.

mod store;

pub use store::{SliceLookup, SliceStore};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::WindowType;

/// Identifies a window (or a slice) by its half-open time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId {
    /// Window start timestamp (inclusive)
    pub start: i64,
    /// Window end timestamp (exclusive)
    pub end: i64,
}

impl WindowId {
    /// Creates a new window ID.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Returns the window duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Returns true if `timestamp` falls inside the window.
    #[inline]
    #[must_use]
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Returns true if `other` lies entirely inside this window.
    #[inline]
    #[must_use]
    pub fn covers(&self, other: &WindowId) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Windows touched by one slice. Four inline slots cover `size / slide <= 4`.
pub type WindowIdVec = SmallVec<[WindowId; 4]>;

/// Errors raised when constructing slices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SliceError {
    /// Slice bounds are empty or inverted.
    #[error("Invalid slice range [{start}, {end})")]
    InvalidRange {
        /// Requested start
        start: i64,
        /// Requested end
        end: i64,
    },

    /// A slice needs at least one partition.
    #[error("Slice must have at least one partition")]
    NoPartitions,
}

/// Computes slice and window boundaries for a window policy.
///
/// Windows start at multiples of `slide_ms` and are `size_ms` long. For
/// tumbling windows `slide_ms == size_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size_ms: i64,
    slide_ms: i64,
}

impl SliceAssigner {
    /// Creates an assigner for sliding windows.
    ///
    /// # Panics
    ///
    /// Panics if size or slide is zero/negative, or if slide > size.
    #[must_use]
    pub fn new(size_ms: i64, slide_ms: i64) -> Self {
        assert!(size_ms > 0, "Window size must be positive");
        assert!(slide_ms > 0, "Slide interval must be positive");
        assert!(
            slide_ms <= size_ms,
            "Slide must not exceed size (use tumbling windows for non-overlapping)"
        );
        Self { size_ms, slide_ms }
    }

    /// Creates an assigner for tumbling windows.
    ///
    /// # Panics
    ///
    /// Panics if size is zero or negative.
    #[must_use]
    pub fn tumbling(size_ms: i64) -> Self {
        Self::new(size_ms, size_ms)
    }

    /// Creates the assigner for a window type.
    ///
    /// # Panics
    ///
    /// Panics on invalid sizes; [`WindowType::validate`] rejects those first.
    #[must_use]
    pub fn for_window(window: &WindowType) -> Self {
        match *window {
            WindowType::Tumbling { size_ms } => Self::tumbling(size_ms),
            WindowType::Sliding { size_ms, slide_ms } => Self::new(size_ms, slide_ms),
        }
    }

    /// Returns the window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Returns the slide interval in milliseconds.
    #[must_use]
    pub fn slide_ms(&self) -> i64 {
        self.slide_ms
    }

    /// Returns the slice covering `timestamp`.
    #[inline]
    #[must_use]
    pub fn slice_for(&self, timestamp: i64) -> WindowId {
        let last_start = floor_to(timestamp, self.slide_ms);
        let last_end = floor_to(timestamp.saturating_sub(self.size_ms), self.slide_ms)
            .saturating_add(self.size_ms);
        let next_start = last_start.saturating_add(self.slide_ms);
        let next_end = last_end.saturating_add(self.slide_ms);
        WindowId::new(last_start.max(last_end), next_start.min(next_end))
    }

    /// Returns every window that contains the slice, ordered by start.
    #[must_use]
    pub fn windows_for_slice(&self, slice: WindowId) -> WindowIdVec {
        let mut windows = WindowIdVec::new();
        let mut start = ceil_to(slice.end.saturating_sub(self.size_ms), self.slide_ms);
        while start <= slice.start {
            windows.push(WindowId::new(start, start.saturating_add(self.size_ms)));
            start = start.saturating_add(self.slide_ms);
        }
        windows
    }

    /// Returns the start of the earliest window whose end is after
    /// `watermark`, i.e. the earliest window not yet complete.
    ///
    /// Slices ending at or before this point are no longer needed by any
    /// window that can still trigger.
    #[must_use]
    pub fn first_open_window_start(&self, watermark: i64) -> i64 {
        // Smallest k*slide with k*slide + size > watermark.
        floor_to(watermark.saturating_sub(self.size_ms), self.slide_ms)
            .saturating_add(self.slide_ms)
    }
}

#[inline]
fn floor_to(timestamp: i64, step: i64) -> i64 {
    timestamp.div_euclid(step).saturating_mul(step)
}

#[inline]
fn ceil_to(timestamp: i64, step: i64) -> i64 {
    let floor = floor_to(timestamp, step);
    if floor == timestamp {
        floor
    } else {
        floor.saturating_add(step)
    }
}

/// A time range of partial window state.
///
/// `P` is the partition payload (hash table or record list) chosen by the
/// operator. Partitions are created on first write through the slice's
/// partition factory.
pub struct Slice<P> {
    id: WindowId,
    sealed: AtomicBool,
    partitions: Box<[OnceLock<Mutex<P>>]>,
    factory: PartitionFactory<P>,
}

/// Creates an empty partition payload for a new slice partition.
pub type PartitionFactory<P> = Arc<dyn Fn() -> P + Send + Sync>;

impl<P> Slice<P> {
    /// Creates an empty slice.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidRange`] if `start >= end` and
    /// [`SliceError::NoPartitions`] if `num_partitions` is zero.
    pub fn new(
        start: i64,
        end: i64,
        num_partitions: usize,
        factory: PartitionFactory<P>,
    ) -> Result<Self, SliceError> {
        if start >= end {
            return Err(SliceError::InvalidRange { start, end });
        }
        if num_partitions == 0 {
            return Err(SliceError::NoPartitions);
        }
        Ok(Self {
            id: WindowId::new(start, end),
            sealed: AtomicBool::new(false),
            partitions: (0..num_partitions).map(|_| OnceLock::new()).collect(),
            factory,
        })
    }

    /// Returns the slice range.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WindowId {
        self.id
    }

    /// Slice start (inclusive).
    #[inline]
    #[must_use]
    pub fn start(&self) -> i64 {
        self.id.start
    }

    /// Slice end (exclusive).
    #[inline]
    #[must_use]
    pub fn end(&self) -> i64 {
        self.id.end
    }

    /// Returns the number of partition slots.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Returns how many partitions have been written to.
    #[must_use]
    pub fn initialized_partitions(&self) -> usize {
        self.partitions.iter().filter(|p| p.get().is_some()).count()
    }

    /// Returns the partition slot for a worker.
    #[inline]
    #[must_use]
    pub fn partition_index(&self, worker_id: usize) -> usize {
        worker_id % self.partitions.len()
    }

    /// Runs `f` on the worker's partition, creating it if needed.
    ///
    /// Returns `None` without calling `f` if the slice has been sealed.
    pub fn write<R>(&self, worker_id: usize, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let slot = &self.partitions[self.partition_index(worker_id)];
        let partition = slot.get_or_init(|| Mutex::new((self.factory)()));
        let mut guard = partition.lock();
        // Checked under the partition lock: `seal` happens before the probe
        // acquires this lock, so a write either lands first or sees the seal.
        if self.sealed.load(Ordering::Acquire) {
            return None;
        }
        Some(f(&mut *guard))
    }

    /// Seals the slice. Returns true if this call sealed it.
    pub fn seal(&self) -> bool {
        !self.sealed.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the slice no longer accepts writes.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Visits every initialized partition in slot order.
    pub fn for_each_partition(&self, mut f: impl FnMut(&P)) {
        for slot in self.partitions.iter() {
            if let Some(partition) = slot.get() {
                f(&*partition.lock());
            }
        }
    }
}

impl<P> fmt::Debug for Slice<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("id", &self.id)
            .field("sealed", &self.is_sealed())
            .field("partitions", &self.partitions.len())
            .field("initialized", &self.initialized_partitions())
            .finish()
    }
}
