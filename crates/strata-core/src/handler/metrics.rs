//! Handler metrics with lock-free counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one window-based operator handler.
///
/// Updated from worker threads with relaxed atomics; read via
/// [`snapshot`](Self::snapshot). Reads are eventually consistent.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    slices_released: AtomicU64,
    windows_triggered: AtomicU64,
    windows_flushed: AtomicU64,
    slices_discarded: AtomicU64,
    late_records_dropped: AtomicU64,
    late_records_side_output: AtomicU64,
    buffers_processed: AtomicU64,
    output_buffers: AtomicU64,
    output_records: AtomicU64,
}

impl HandlerMetrics {
    /// Create a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_buffer(&self) {
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_window(&self, flushed: bool) {
        self.windows_triggered.fetch_add(1, Ordering::Relaxed);
        if flushed {
            self.windows_flushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_output(&self, records: usize) {
        self.output_buffers.fetch_add(1, Ordering::Relaxed);
        self.output_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self, slices: usize) {
        self.slices_released
            .fetch_add(slices as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, slices: usize) {
        self.slices_discarded
            .fetch_add(slices as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_late(&self, records: usize, side_output: bool) {
        let counter = if side_output {
            &self.late_records_side_output
        } else {
            &self.late_records_dropped
        };
        counter.fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    ///
    /// `slices_created` is owned by the slice store and passed in.
    #[must_use]
    pub fn snapshot(&self, slices_created: u64) -> HandlerMetricsSnapshot {
        HandlerMetricsSnapshot {
            slices_created,
            slices_released: self.slices_released.load(Ordering::Relaxed),
            windows_triggered: self.windows_triggered.load(Ordering::Relaxed),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
            slices_discarded: self.slices_discarded.load(Ordering::Relaxed),
            late_records_dropped: self.late_records_dropped.load(Ordering::Relaxed),
            late_records_side_output: self.late_records_side_output.load(Ordering::Relaxed),
            buffers_processed: self.buffers_processed.load(Ordering::Relaxed),
            output_buffers: self.output_buffers.load(Ordering::Relaxed),
            output_records: self.output_records.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of handler metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerMetricsSnapshot {
    /// Slices created by the build side
    pub slices_created: u64,
    /// Slices released after their last window was probed
    pub slices_released: u64,
    /// Windows probed (including flushed ones)
    pub windows_triggered: u64,
    /// Windows probed by a graceful stop
    pub windows_flushed: u64,
    /// Slices discarded unprobed by a hard stop
    pub slices_discarded: u64,
    /// Late records dropped
    pub late_records_dropped: u64,
    /// Late records routed to the side output
    pub late_records_side_output: u64,
    /// Buffers reported by the build side
    pub buffers_processed: u64,
    /// Buffers emitted downstream
    pub output_buffers: u64,
    /// Records emitted downstream
    pub output_records: u64,
}

impl HandlerMetricsSnapshot {
    /// Total late records, dropped or routed.
    #[must_use]
    pub fn late_records(&self) -> u64 {
        self.late_records_dropped + self.late_records_side_output
    }
}
