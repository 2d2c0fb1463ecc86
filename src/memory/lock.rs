//! Lock types an `AllocatorHandle` can be parameterised with.

use crate::sync::RawMutex;

/// A mutual-exclusion primitive with separate lock and unlock calls.
///
/// # Safety
/// Implementations must provide mutual exclusion between a `lock` and the
/// matching `unlock`, unless they are documented as a no-op (like
/// [`NoLock`]), in which case they must not implement [`SyncLock`].
pub unsafe trait RawLock {
    fn new() -> Self;

    /// Block until the lock is acquired.
    fn lock(&self);

    /// # Safety
    /// The lock must be held by the current context.
    unsafe fn unlock(&self);
}

/// Marker for locks that really exclude other threads.
///
/// Only handles over a `SyncLock` can be shared between threads or hand out
/// a scoped [`LockedAllocator`](super::handle::LockedAllocator).
///
/// # Safety
/// `lock` must block while another thread holds the lock.
pub unsafe trait SyncLock: RawLock + Sync {}

/// A lock that does nothing. Handles using it are single-threaded.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLock;

// Safety: no-op, and deliberately not a SyncLock.
unsafe impl RawLock for NoLock {
    #[inline]
    fn new() -> Self {
        NoLock
    }

    #[inline]
    fn lock(&self) {}

    #[inline]
    unsafe fn unlock(&self) {}
}

/// The mutex used when a handle asks for thread safety without naming a lock.
pub struct DefaultMutex(RawMutex);

impl std::fmt::Debug for DefaultMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DefaultMutex")
    }
}

impl Default for DefaultMutex {
    fn default() -> Self {
        <Self as RawLock>::new()
    }
}

#[cfg(not(loom))]
// Safety: parking_lot's RawMutex provides mutual exclusion.
unsafe impl RawLock for DefaultMutex {
    #[inline]
    fn new() -> Self {
        use parking_lot::lock_api::RawMutex as _;
        Self(RawMutex::INIT)
    }

    #[inline]
    fn lock(&self) {
        use parking_lot::lock_api::RawMutex as _;
        self.0.lock();
    }

    #[inline]
    unsafe fn unlock(&self) {
        use parking_lot::lock_api::RawMutex as _;
        // Safety: upheld by caller.
        unsafe { self.0.unlock() };
    }
}

#[cfg(loom)]
// Safety: the loom shim is a test-and-set lock.
unsafe impl RawLock for DefaultMutex {
    fn new() -> Self {
        Self(RawMutex::new())
    }

    fn lock(&self) {
        self.0.lock();
    }

    unsafe fn unlock(&self) {
        self.0.unlock();
    }
}

// Safety: see the RawLock impls above.
unsafe impl SyncLock for DefaultMutex {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::thread;

    #[test]
    fn test_default_mutex_excludes() {
        struct Shared {
            lock: DefaultMutex,
            inside: AtomicUsize,
            total: AtomicUsize,
        }

        let shared = Arc::new(Shared {
            lock: DefaultMutex::new(),
            inside: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..500 {
                        shared.lock.lock();
                        assert_eq!(shared.inside.fetch_add(1, Ordering::SeqCst), 0);
                        shared.total.fetch_add(1, Ordering::Relaxed);
                        shared.inside.fetch_sub(1, Ordering::SeqCst);
                        // Safety: Test code; locked above.
                        unsafe { shared.lock.unlock() };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.total.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_no_lock_is_reentrant_noop() {
        let lock = NoLock::new();
        lock.lock();
        lock.lock();
        // Safety: Test code.
        unsafe {
            lock.unlock();
            lock.unlock();
        }
    }
}
