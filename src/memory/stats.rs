//! Heap counters for diagnostics.
//!
//! Counters are bumped with `Relaxed` ordering on slow paths only, so a
//! snapshot is not atomic across fields: `committed_bytes` can briefly lag
//! `pages_committed - pages_decommitted`. Nothing in the allocator reads them
//! to make a decision.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// A relaxed counter that may also be used as a gauge.
///
/// A gauge decremented by one thread before another thread's matching
/// increment lands can dip below zero for a moment; reads clamp to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(val.min(isize::MAX as usize).cast_signed(), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(val.min(isize::MAX as usize).cast_signed(), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-heap counters, owned by the heap's arena.
#[derive(Default)]
pub struct HeapStats {
    /// Commits, including recommits of scavenged pages.
    pub pages_committed: Counter,
    pub pages_decommitted: Counter,
    /// Gauge.
    pub committed_bytes: Counter,
    pub views_created: Counter,
    /// Frees that went straight to a view instead of the freeing thread's
    /// cache.
    pub remote_frees: Counter,
    /// Thread-cache misses that claimed a batch from the directory.
    pub cache_refills: Counter,
}

impl HeapStats {
    pub fn snapshot(&self) -> HeapStatsSnapshot {
        HeapStatsSnapshot {
            pages_committed: self.pages_committed.get(),
            pages_decommitted: self.pages_decommitted.get(),
            committed_bytes: self.committed_bytes.get(),
            views_created: self.views_created.get(),
            remote_frees: self.remote_frees.get(),
            cache_refills: self.cache_refills.get(),
        }
    }
}

/// Copy of a heap's counters, as returned by [`Heap::stats`](crate::Heap::stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStatsSnapshot {
    pub pages_committed: usize,
    pub pages_decommitted: usize,
    pub committed_bytes: usize,
    pub views_created: usize,
    pub remote_frees: usize,
    pub cache_refills: usize,
}

/// Views by state, read from their status words.
///
/// A decommitted view is counted in `decommitted` only, not in `empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewCensus {
    pub empty: usize,
    pub partial: usize,
    pub full: usize,
    pub decommitted: usize,
}

impl ViewCensus {
    /// Every view created so far.
    pub fn total(&self) -> usize {
        self.empty + self.partial + self.full + self.decommitted
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_reads_clamp_at_zero() {
        let gauge = Counter::new();
        gauge.sub(5);
        assert_eq!(gauge.get(), 0);
        gauge.add(8);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_snapshot_copies_every_counter() {
        let stats = HeapStats::default();
        stats.pages_committed.add(3);
        stats.pages_decommitted.incr();
        stats.committed_bytes.add(2 * 16384);
        stats.remote_frees.incr();
        stats.cache_refills.add(4);

        assert_eq!(
            stats.snapshot(),
            HeapStatsSnapshot {
                pages_committed: 3,
                pages_decommitted: 1,
                committed_bytes: 32768,
                views_created: 0,
                remote_frees: 1,
                cache_refills: 4,
            }
        );
    }

    #[test]
    fn test_census_total_includes_decommitted() {
        let census = ViewCensus {
            empty: 2,
            partial: 3,
            full: 1,
            decommitted: 2,
        };
        assert_eq!(census.total(), 8);
    }
}
