//! Ordered, concurrently accessible collection of slices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{PartitionFactory, Slice, SliceAssigner, SliceError, WindowId};

/// Result of resolving a record timestamp to a slice.
#[derive(Debug)]
pub enum SliceLookup<P> {
    /// The slice that accepts the record.
    Slice(Arc<Slice<P>>),
    /// Every window the record belongs to has already triggered.
    Late,
}

/// Slices of one operator instance, keyed by start timestamp.
///
/// Lookups take a shared lock; only slice creation and garbage collection
/// take the exclusive lock. Writes to slice state go through the slice's own
/// partition locks, so concurrent workers never serialize on the store.
///
/// The store keeps a retention threshold: the start of the earliest window
/// that has not triggered. Slices ending at or before it are sealed and
/// removed, and timestamps resolving to such slices are reported as
/// [`SliceLookup::Late`] instead of resurrecting a slice that could never
/// trigger again.
pub struct SliceStore<P> {
    assigner: SliceAssigner,
    num_partitions: usize,
    factory: PartitionFactory<P>,
    slices: RwLock<BTreeMap<i64, Arc<Slice<P>>>>,
    retention_threshold: AtomicI64,
    slices_created: AtomicU64,
}

impl<P> SliceStore<P> {
    /// Creates an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::NoPartitions`] if `num_partitions` is zero.
    pub fn new(
        assigner: SliceAssigner,
        num_partitions: usize,
        factory: PartitionFactory<P>,
    ) -> Result<Self, SliceError> {
        if num_partitions == 0 {
            return Err(SliceError::NoPartitions);
        }
        Ok(Self {
            assigner,
            num_partitions,
            factory,
            slices: RwLock::new(BTreeMap::new()),
            retention_threshold: AtomicI64::new(i64::MIN),
            slices_created: AtomicU64::new(0),
        })
    }

    /// Returns the slice assigner.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Returns the number of partitions per slice.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Returns the current retention threshold.
    #[must_use]
    pub fn retention_threshold(&self) -> i64 {
        self.retention_threshold.load(Ordering::Acquire)
    }

    /// Total number of slices created since the store was built.
    #[must_use]
    pub fn slices_created(&self) -> u64 {
        self.slices_created.load(Ordering::Relaxed)
    }

    /// Number of slices currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.read().len()
    }

    /// Returns true if no slices are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.read().is_empty()
    }

    /// Resolves `timestamp` to its slice, creating the slice if needed.
    ///
    /// # Errors
    ///
    /// Propagates [`SliceError`] from slice construction.
    pub fn get_or_create_slice(&self, timestamp: i64) -> Result<SliceLookup<P>, SliceError> {
        let id = self.assigner.slice_for(timestamp);
        // At the bottom of the i64 range no window fits and the slice is
        // empty; such records can never be emitted.
        if id.start >= id.end || id.end <= self.retention_threshold() {
            return Ok(SliceLookup::Late);
        }

        if let Some(slice) = self.slices.read().get(&id.start) {
            return Ok(SliceLookup::Slice(Arc::clone(slice)));
        }

        let mut slices = self.slices.write();
        // The threshold may have moved while waiting for the write lock.
        if id.end <= self.retention_threshold() {
            return Ok(SliceLookup::Late);
        }
        if let Some(slice) = slices.get(&id.start) {
            return Ok(SliceLookup::Slice(Arc::clone(slice)));
        }

        let slice = Arc::new(Slice::new(
            id.start,
            id.end,
            self.num_partitions,
            Arc::clone(&self.factory),
        )?);
        slices.insert(id.start, Arc::clone(&slice));
        self.slices_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(slice = %id, "created slice");
        Ok(SliceLookup::Slice(slice))
    }

    /// Returns the retained slices inside `window`, ordered by start.
    #[must_use]
    pub fn slices_for_window(&self, window: WindowId) -> Vec<Arc<Slice<P>>> {
        self.slices
            .read()
            .range(window.start..window.end)
            .map(|(_, slice)| slice)
            .filter(|slice| slice.end() <= window.end)
            .cloned()
            .collect()
    }

    /// Returns the windows with `after < end <= up_to` that cover at least
    /// one retained slice, ordered by end (and start).
    #[must_use]
    pub fn windows_to_trigger(&self, after: i64, up_to: i64) -> Vec<WindowId> {
        if up_to <= after {
            return Vec::new();
        }
        let slices = self.slices.read();
        let mut windows = BTreeSet::new();
        for slice in slices.values() {
            for window in self.assigner.windows_for_slice(slice.id()) {
                if window.end > after && window.end <= up_to {
                    windows.insert(window);
                }
            }
        }
        windows.into_iter().collect()
    }

    /// Moves the retention threshold to the earliest open window for
    /// `watermark` and seals every slice ending at or before it.
    ///
    /// Returns the new threshold. The threshold never moves backwards.
    pub fn advance_trigger_watermark(&self, watermark: i64) -> i64 {
        let candidate = self.assigner.first_open_window_start(watermark);
        let previous = self
            .retention_threshold
            .fetch_max(candidate, Ordering::AcqRel);
        let threshold = previous.max(candidate);
        if threshold > previous {
            let slices = self.slices.read();
            for slice in slices.range(..threshold).map(|(_, s)| s) {
                if slice.end() <= threshold {
                    slice.seal();
                }
            }
        }
        threshold
    }

    /// Removes every slice ending at or before `threshold`.
    ///
    /// Removed slices are sealed and returned so the caller decides when
    /// their state is released.
    pub fn remove_slices_below(&self, threshold: i64) -> Vec<Arc<Slice<P>>> {
        let mut slices = self.slices.write();
        let keep = match slices.range(..threshold).next_back() {
            // A slice starting before the threshold but ending after it stays.
            Some((&start, slice)) if slice.end() > threshold => start,
            _ => threshold,
        };
        let retained = slices.split_off(&keep);
        let removed = std::mem::replace(&mut *slices, retained);
        drop(slices);

        if !removed.is_empty() {
            tracing::debug!(
                threshold,
                removed = removed.len(),
                "removed slices below threshold"
            );
        }
        removed
            .into_values()
            .inspect(|slice| {
                slice.seal();
            })
            .collect()
    }

    /// Seals and removes every slice.
    pub fn drain_all(&self) -> Vec<Arc<Slice<P>>> {
        let removed = std::mem::take(&mut *self.slices.write());
        removed
            .into_values()
            .inspect(|slice| {
                slice.seal();
            })
            .collect()
    }
}

impl<P> std::fmt::Debug for SliceStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceStore")
            .field("assigner", &self.assigner)
            .field("num_partitions", &self.num_partitions)
            .field("slices", &self.len())
            .field("retention_threshold", &self.retention_threshold())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_store(assigner: SliceAssigner) -> SliceStore<u64> {
        SliceStore::new(assigner, 2, Arc::new(|| 0u64)).unwrap()
    }

    fn slice(lookup: SliceLookup<u64>) -> Arc<Slice<u64>> {
        match lookup {
            SliceLookup::Slice(slice) => slice,
            SliceLookup::Late => panic!("expected a slice"),
        }
    }

    #[test]
    fn test_get_or_create_reuses_slice() {
        let store = counter_store(SliceAssigner::tumbling(10));

        let a = slice(store.get_or_create_slice(3).unwrap());
        let b = slice(store.get_or_create_slice(7).unwrap());
        let c = slice(store.get_or_create_slice(12).unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(store.len(), 2);
        assert_eq!(store.slices_created(), 2);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let err = SliceStore::new(SliceAssigner::tumbling(10), 0, Arc::new(|| 0u64)).unwrap_err();
        assert_eq!(err, SliceError::NoPartitions);
    }

    #[test]
    fn test_windows_to_trigger_tumbling() {
        let store = counter_store(SliceAssigner::tumbling(10));
        for ts in [1, 15, 22, 35] {
            store.get_or_create_slice(ts).unwrap();
        }

        assert!(store.windows_to_trigger(i64::MIN, 5).is_empty());
        assert_eq!(
            store.windows_to_trigger(i64::MIN, 30),
            vec![
                WindowId::new(0, 10),
                WindowId::new(10, 20),
                WindowId::new(20, 30)
            ]
        );
        assert_eq!(
            store.windows_to_trigger(20, 40),
            vec![WindowId::new(20, 30), WindowId::new(30, 40)]
        );
        assert!(store.windows_to_trigger(40, 40).is_empty());
    }

    #[test]
    fn test_windows_to_trigger_sliding() {
        let store = counter_store(SliceAssigner::new(10, 5));
        store.get_or_create_slice(7).unwrap();

        // Slice [5,10) belongs to [0,10) and [5,15).
        assert_eq!(
            store.windows_to_trigger(i64::MIN, 20),
            vec![WindowId::new(0, 10), WindowId::new(5, 15)]
        );
    }

    #[test]
    fn test_slices_for_window() {
        let store = counter_store(SliceAssigner::new(10, 5));
        for ts in [2, 7, 12] {
            store.get_or_create_slice(ts).unwrap();
        }

        let ids: Vec<_> = store
            .slices_for_window(WindowId::new(5, 15))
            .iter()
            .map(|s| s.id())
            .collect();
        assert_eq!(ids, vec![WindowId::new(5, 10), WindowId::new(10, 15)]);
    }

    #[test]
    fn test_advance_seals_and_marks_late() {
        let store = counter_store(SliceAssigner::tumbling(10));
        let early = slice(store.get_or_create_slice(5).unwrap());
        let open = slice(store.get_or_create_slice(15).unwrap());

        assert_eq!(store.advance_trigger_watermark(12), 10);
        assert!(early.is_sealed());
        assert!(!open.is_sealed());
        assert!(early.write(0, |c| *c += 1).is_none());

        assert!(matches!(store.get_or_create_slice(9).unwrap(), SliceLookup::Late));
        assert!(matches!(
            store.get_or_create_slice(10).unwrap(),
            SliceLookup::Slice(_)
        ));
    }

    #[test]
    fn test_min_timestamp_resolves_late() {
        let store = counter_store(SliceAssigner::tumbling(10));
        assert!(matches!(
            store.get_or_create_slice(i64::MIN).unwrap(),
            SliceLookup::Late
        ));
        assert_eq!(store.len(), 0);

        let sliding = counter_store(SliceAssigner::new(10, 5));
        assert!(matches!(
            sliding.get_or_create_slice(i64::MIN).unwrap(),
            SliceLookup::Late
        ));
    }

    #[test]
    fn test_threshold_never_regresses() {
        let store = counter_store(SliceAssigner::tumbling(10));
        assert_eq!(store.advance_trigger_watermark(30), 30);
        assert_eq!(store.advance_trigger_watermark(12), 30);
        assert_eq!(store.retention_threshold(), 30);
    }

    #[test]
    fn test_sliding_slice_not_late_while_a_window_is_open() {
        let store = counter_store(SliceAssigner::new(10, 5));
        // Window [0,10) has triggered, [5,15) has not.
        store.advance_trigger_watermark(10);
        assert!(matches!(
            store.get_or_create_slice(7).unwrap(),
            SliceLookup::Slice(_)
        ));
        assert!(matches!(store.get_or_create_slice(3).unwrap(), SliceLookup::Late));
    }

    #[test]
    fn test_remove_slices_below() {
        let store = counter_store(SliceAssigner::tumbling(10));
        for ts in [1, 15, 22] {
            store.get_or_create_slice(ts).unwrap();
        }

        let removed = store.remove_slices_below(20);
        let ids: Vec<_> = removed.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![WindowId::new(0, 10), WindowId::new(10, 20)]);
        assert!(removed.iter().all(|s| s.is_sealed()));
        assert_eq!(store.len(), 1);

        assert!(store.remove_slices_below(20).is_empty());
    }

    #[test]
    fn test_remove_keeps_straddling_slice() {
        let store = counter_store(SliceAssigner::tumbling(10));
        store.get_or_create_slice(15).unwrap();

        assert!(store.remove_slices_below(12).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_drain_all() {
        let store = counter_store(SliceAssigner::tumbling(10));
        for ts in [1, 15] {
            store.get_or_create_slice(ts).unwrap();
        }

        let drained = store.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|s| s.is_sealed()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_creation_yields_one_slice() {
        let store = Arc::new(counter_store(SliceAssigner::tumbling(100)));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let s = slice(store.get_or_create_slice(i).unwrap());
                        s.write(worker, |c| *c += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.slices_created(), 1);
        let mut total = 0;
        store.slices_for_window(WindowId::new(0, 100))[0].for_each_partition(|c| total += *c);
        assert_eq!(total, 800);
    }
}
