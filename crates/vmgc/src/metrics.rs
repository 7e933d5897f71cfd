//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Statistics from the most recent collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Longest participant time in the run.
    pub duration: Duration,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Sequence number of the run.
    pub seq: u32,
    /// Threads that took part (including stolen ones).
    pub participants: usize,
    /// Threads collected on behalf of a blocked owner.
    pub threads_stolen: usize,
    /// Objects copied within the nursery.
    pub objects_copied: usize,
    /// Objects promoted into gen2.
    pub objects_promoted: usize,
    /// Gen2 objects marked in place.
    pub gen2_marked: usize,
    /// Objects freed by the sweeps.
    pub objects_freed: usize,
    /// Type descriptors destroyed.
    pub descriptors_freed: usize,
    /// Routed batches dispatched to other threads.
    pub batches_passed: usize,
    /// Total runs since the instance started.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// All-zero metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            collection_type: CollectionType::None,
            seq: 0,
            participants: 0,
            threads_stolen: 0,
            objects_copied: 0,
            objects_promoted: 0,
            gen2_marked: 0,
            objects_freed: 0,
            descriptors_freed: 0,
            batches_passed: 0,
            total_collections: 0,
        }
    }
}

/// Type of collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No run has happened yet.
    #[default]
    None = 0,
    /// Nursery only.
    Nursery = 1,
    /// Nursery and gen2.
    Full = 2,
}

/// Counts gathered by one participant during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunStats {
    pub(crate) copied: usize,
    pub(crate) promoted: usize,
    pub(crate) gen2_marked: usize,
    pub(crate) freed: usize,
    pub(crate) descriptors_freed: usize,
    pub(crate) batches_passed: usize,
    pub(crate) threads_stolen: usize,
}

/// Run-scoped accumulation of every participant's [`RunStats`].
#[derive(Debug, Default)]
pub(crate) struct RunTotals {
    participants: AtomicUsize,
    copied: AtomicUsize,
    promoted: AtomicUsize,
    gen2_marked: AtomicUsize,
    freed: AtomicUsize,
    descriptors_freed: AtomicUsize,
    batches_passed: AtomicUsize,
    threads_stolen: AtomicUsize,
    duration_ns: AtomicU64,
}

impl RunTotals {
    pub(crate) fn add(&self, stats: &RunStats, elapsed: Duration) {
        self.participants.fetch_add(1, Ordering::Relaxed);
        self.copied.fetch_add(stats.copied, Ordering::Relaxed);
        self.promoted.fetch_add(stats.promoted, Ordering::Relaxed);
        self.gen2_marked.fetch_add(stats.gen2_marked, Ordering::Relaxed);
        self.freed.fetch_add(stats.freed, Ordering::Relaxed);
        self.descriptors_freed
            .fetch_add(stats.descriptors_freed, Ordering::Relaxed);
        self.batches_passed
            .fetch_add(stats.batches_passed, Ordering::Relaxed);
        self.threads_stolen
            .fetch_add(stats.threads_stolen, Ordering::Relaxed);
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.duration_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn add_descriptors_freed(&self, n: usize) {
        self.descriptors_freed.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot and reset for the next run.
    pub(crate) fn take(&self, collection_type: CollectionType, seq: u32) -> GcMetrics {
        GcMetrics {
            duration: Duration::from_nanos(self.duration_ns.swap(0, Ordering::Relaxed)),
            collection_type,
            seq,
            participants: self.participants.swap(0, Ordering::Relaxed),
            threads_stolen: self.threads_stolen.swap(0, Ordering::Relaxed),
            objects_copied: self.copied.swap(0, Ordering::Relaxed),
            objects_promoted: self.promoted.swap(0, Ordering::Relaxed),
            gen2_marked: self.gen2_marked.swap(0, Ordering::Relaxed),
            objects_freed: self.freed.swap(0, Ordering::Relaxed),
            descriptors_freed: self.descriptors_freed.swap(0, Ordering::Relaxed),
            batches_passed: self.batches_passed.swap(0, Ordering::Relaxed),
            total_collections: 0,
        }
    }
}

/// Cumulative statistics of one instance.
///
/// # Example
///
/// ```
/// use vmgc::{GcConfig, Instance};
///
/// let instance = Instance::new(GcConfig::default()).unwrap();
/// instance.main_thread().collect();
/// assert_eq!(instance.global_metrics().total_collections(), 1);
/// ```
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    nursery_collections: AtomicUsize,
    full_collections: AtomicUsize,
    objects_freed: AtomicUsize,
    objects_promoted: AtomicUsize,
    pause_ns: AtomicU64,
}

impl GlobalMetrics {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            nursery_collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            objects_promoted: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Folds a finished run in and returns the new total run count.
    pub(crate) fn record(&self, run: &GcMetrics) -> usize {
        match run.collection_type {
            CollectionType::Nursery => {
                self.nursery_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Full => {
                self.full_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        self.objects_freed
            .fetch_add(run.objects_freed, Ordering::Relaxed);
        self.objects_promoted
            .fetch_add(run.objects_promoted, Ordering::Relaxed);
        let ns = u64::try_from(run.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(ns, Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total runs.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Nursery-only runs.
    #[inline]
    #[must_use]
    pub fn total_nursery_collections(&self) -> usize {
        self.nursery_collections.load(Ordering::Relaxed)
    }

    /// Full runs.
    #[inline]
    #[must_use]
    pub fn total_full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Objects freed across all runs.
    #[inline]
    #[must_use]
    pub fn total_objects_freed(&self) -> usize {
        self.objects_freed.load(Ordering::Relaxed)
    }

    /// Objects promoted across all runs.
    #[inline]
    #[must_use]
    pub fn total_objects_promoted(&self) -> usize {
        self.objects_promoted.load(Ordering::Relaxed)
    }

    /// Sum of run durations in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_take_resets() {
        let totals = RunTotals::default();
        let stats = RunStats {
            copied: 3,
            freed: 2,
            ..RunStats::default()
        };
        totals.add(&stats, Duration::from_millis(2));
        totals.add(&stats, Duration::from_millis(5));
        let m = totals.take(CollectionType::Nursery, 7);
        assert_eq!(m.participants, 2);
        assert_eq!(m.objects_copied, 6);
        assert_eq!(m.objects_freed, 4);
        assert_eq!(m.duration, Duration::from_millis(5));
        assert_eq!(m.seq, 7);
        assert_eq!(totals.take(CollectionType::Nursery, 8).participants, 0);
    }

    #[test]
    fn test_global_record() {
        let global = GlobalMetrics::new();
        let run = GcMetrics {
            collection_type: CollectionType::Full,
            objects_freed: 5,
            ..GcMetrics::new()
        };
        assert_eq!(global.record(&run), 1);
        assert_eq!(global.total_full_collections(), 1);
        assert_eq!(global.total_nursery_collections(), 0);
        assert_eq!(global.total_objects_freed(), 5);
    }
}
