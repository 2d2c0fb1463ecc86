//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions, with the one exception
//! of the leak report, which reads a single counter at shutdown.

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
    #[must_use]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes held by block pools, handed out or cached
crate::sync::static_atomic! {
    pub static BLOCK_POOL_RESERVED: Counter = Counter::new();
}
// Bytes sitting in block pool free stacks
crate::sync::static_atomic! {
    pub static BLOCK_POOL_CACHED: Counter = Counter::new();
}

// Bytes handed out by HeapAllocator and not yet returned
crate::sync::static_atomic! {
    pub static HEAP_OUTSTANDING: Counter = Counter::new();
}

// Bytes committed by VirtualMemoryAllocator
crate::sync::static_atomic! {
    pub static VM_COMMITTED: Counter = Counter::new();
}

/// Point-in-time copy of the counters above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub block_pool_reserved: usize,
    pub block_pool_cached: usize,
    pub heap_outstanding: usize,
    pub vm_committed: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        block_pool_reserved: BLOCK_POOL_RESERVED.get(),
        block_pool_cached: BLOCK_POOL_CACHED.get(),
        heap_outstanding: HEAP_OUTSTANDING.get(),
        vm_committed: VM_COMMITTED.get(),
    }
}
