/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - One or two allocator calls per thread.
///   - Handler slots are loom lazy statics, so each model run starts from
///     the built-in defaults.
///   - The `DefaultMutex` shim spins with `yield_now`; tests that contend on
///     it use `preemption_bound(2)`.
#[cfg(loom)]
mod tests {
    use crate::memory::error::{AllocError, AllocatorInfo};
    use crate::memory::handle::{AllocatorHandle, make_thread_safe_allocator};
    use crate::memory::traits::RawAllocator;
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use crate::sync::cell::UnsafeCell;
    use std::ptr::NonNull;

    // =====================================================================
    // Helpers
    // =====================================================================

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    /// Stateful allocator whose state lives in a loom cell, so unsynchronised
    /// access is reported as a data race.
    struct Tracked {
        calls: UnsafeCell<usize>,
        busy: AtomicBool,
    }

    impl Tracked {
        fn new() -> Self {
            Self {
                calls: UnsafeCell::new(0),
                busy: AtomicBool::new(false),
            }
        }

        fn bump(&self) {
            assert!(!self.busy.swap(true, Ordering::Relaxed), "allocator re-entered mid-call");
            self.calls.with_mut(|p| unsafe { *p += 1 });
            self.busy.store(false, Ordering::Relaxed);
        }

        fn calls(&self) -> usize {
            self.calls.with(|p| unsafe { *p })
        }
    }

    impl RawAllocator for Tracked {
        fn allocate_node(&mut self, _size: usize, _alignment: usize) -> Result<NonNull<u8>, AllocError> {
            self.bump();
            Ok(NonNull::dangling())
        }

        unsafe fn deallocate_node(&mut self, _node: NonNull<u8>, _size: usize, _alignment: usize) {
            self.bump();
        }
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. AllocatorHandle locking
    // =====================================================================

    #[test]
    fn loom_thread_safe_handle_serializes_stateful_allocator() {
        bounded(2).check(|| {
            let handle = Arc::new(make_thread_safe_allocator(Tracked::new()));
            let h1 = handle.clone();
            let h2 = handle.clone();

            let t1 = loom::thread::spawn(move || {
                let node = h1.allocate_node(8, 8).unwrap();
                // Safety: Test code; Tracked never dereferences.
                unsafe { h1.deallocate_node(node, 8, 8) };
            });
            let t2 = loom::thread::spawn(move || {
                h2.allocate_node(16, 8).unwrap();
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(handle.lock().calls(), 3);
        });
    }

    #[test]
    fn loom_locked_view_excludes_other_callers() {
        bounded(2).check(|| {
            let handle = Arc::new(make_thread_safe_allocator(Tracked::new()));
            let h1 = handle.clone();

            let t1 = loom::thread::spawn(move || {
                let mut locked = h1.lock();
                let before = locked.calls();
                locked.allocate_node(8, 8).unwrap();
                locked.allocate_node(8, 8).unwrap();
                // Nobody else got in between the two calls.
                assert_eq!(locked.calls(), before + 2);
            });

            handle.allocate_node(8, 8).unwrap();
            t1.join().unwrap();

            assert_eq!(handle.lock().calls(), 3);
        });
    }

    #[test]
    fn loom_shared_reference_is_an_allocator() {
        bounded(2).check(|| {
            let handle: Arc<AllocatorHandle<_, _>> = Arc::new(make_thread_safe_allocator(Tracked::new()));
            let h1 = handle.clone();

            let t1 = loom::thread::spawn(move || {
                let mut shared = &*h1;
                RawAllocator::allocate_node(&mut shared, 4, 4).unwrap();
            });

            let mut shared = &*handle;
            RawAllocator::allocate_node(&mut shared, 4, 4).unwrap();
            t1.join().unwrap();

            assert_eq!(handle.lock().calls(), 2);
        });
    }

    // =====================================================================
    // 3. Diagnostic handler slots
    // =====================================================================

    #[test]
    fn loom_concurrent_handler_swaps_never_tear() {
        use crate::memory::debugging::{get_leak_handler, set_leak_handler};

        loom::lazy_static! {
            static ref HITS: AtomicUsize = AtomicUsize::new(0);
        }

        fn first(_info: &AllocatorInfo, _amount: usize) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }
        fn second(_info: &AllocatorInfo, _amount: usize) {
            HITS.fetch_add(100, Ordering::Relaxed);
        }

        loom::model(|| {
            let t1 = loom::thread::spawn(|| {
                set_leak_handler(Some(first));
            });
            let t2 = loom::thread::spawn(|| {
                set_leak_handler(Some(second));
            });

            // Whatever the reader sees is a complete handler.
            get_leak_handler()(&AllocatorInfo::new("loom", 0), 1);

            t1.join().unwrap();
            t2.join().unwrap();

            let before = HITS.load(Ordering::Relaxed);
            get_leak_handler()(&AllocatorInfo::new("loom", 0), 1);
            let delta = HITS.load(Ordering::Relaxed) - before;
            assert!(delta == 1 || delta == 100);
        });
    }
}
