//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Total bytes currently mapped from the OS by the allocator
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}

// Breakdown by subsystem
crate::sync::static_atomic! {
    pub static SLAB_MAPPED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static BIG_MAPPED: Counter = Counter::new();
}

// VM adapter call counts.  The reuse paths (magazines, zone magazine,
// bigcache) exist to keep these flat; tests assert on the deltas.
crate::sync::static_atomic! {
    pub static VM_MAP_CALLS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static VM_UNMAP_CALLS: Counter = Counter::new();
}

/// Point-in-time snapshot of the diagnostic gauges.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStats {
    pub total_mapped: usize,
    pub slab_mapped: usize,
    pub big_mapped: usize,
    /// Committed bytes of oversized allocations beyond their caller-visible
    /// size; the sweep trims this back once it crosses its threshold.
    pub big_excess: usize,
    pub vm_map_calls: usize,
    pub vm_unmap_calls: usize,
}

pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_mapped: TOTAL_MAPPED.load(Ordering::Relaxed),
        slab_mapped: SLAB_MAPPED.load(Ordering::Relaxed),
        big_mapped: BIG_MAPPED.load(Ordering::Relaxed),
        big_excess: super::big::excess_bytes(),
        vm_map_calls: VM_MAP_CALLS.load(Ordering::Relaxed),
        vm_unmap_calls: VM_UNMAP_CALLS.load(Ordering::Relaxed),
    }
}
