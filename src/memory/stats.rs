//! Process-wide diagnostic gauges.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
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
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Clamp absurd deltas instead of panicking.
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
    #[must_use]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by live slabs.
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Bytes committed by live slabs.
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}
// Chunks handed out and not yet freed, across all slabs.
crate::sync::static_atomic! {
    pub static SLAB_LIVE_CHUNKS: Counter = Counter::new();
}
// Oversized requests forwarded to the heap and not yet freed. Each allocator
// only subtracts what it added, so frees of foreign heap blocks do not count.
crate::sync::static_atomic! {
    pub static HEAP_LIVE_ALLOCS: Counter = Counter::new();
}

/// Point-in-time copy of the gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub slab_live_chunks: usize,
    pub heap_live_allocs: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            total_committed: TOTAL_COMMITTED.get(),
            slab_live_chunks: SLAB_LIVE_CHUNKS.get(),
            heap_live_allocs: HEAP_LIVE_ALLOCS.get(),
        }
    }
}
