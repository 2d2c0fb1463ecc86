#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::block_pool::BlockPool;
    use crate::memory::block_stack::BlockStack;
    use crate::memory::erased::{AnyAllocator, TypeErased};
    use crate::memory::error::{AllocError, AllocatorInfo, set_bad_allocation_size_handler};
    use crate::memory::handle::{
        AllocatorHandle, AnyAllocatorReference, make_any_allocator_reference, make_stateless_reference,
        make_thread_safe_allocator,
    };
    use crate::memory::heap::{HeapAllocator, report_leaks};
    use crate::memory::size_class::{Log2Policy, SizeClassPolicy};
    use crate::memory::stats;
    use crate::memory::traits::RawAllocator;
    use crate::memory::vm::{VirtualMemoryAllocator, page_size};
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_block_pool_over_shared_heap_handle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let upstream = make_thread_safe_allocator(HeapAllocator);
        let mut first = BlockPool::new(512, &upstream);
        let mut second = BlockPool::new(256, &upstream);

        for _ in 0..4 {
            let a = first.allocate().unwrap();
            let b = second.allocate().unwrap();
            // Safety: Test code; blocks are writable for their usable size.
            unsafe {
                std::ptr::write_bytes(a.memory.as_ptr(), 0xA1, a.size);
                std::ptr::write_bytes(b.memory.as_ptr(), 0xB2, b.size);
            }
        }
        assert_eq!(first.size(), 4);
        assert_eq!(second.size(), 4);
        assert_eq!(first.next_block_size(), 512 * 16 - BlockStack::overhead());
    }

    #[test]
    fn test_block_pool_threads_share_one_upstream() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let upstream = Arc::new(make_thread_safe_allocator(HeapAllocator));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let upstream = Arc::clone(&upstream);
                thread::spawn(move || {
                    let mut pool = BlockPool::new(128, &*upstream);
                    for round in 0..8 {
                        let block = pool.allocate().unwrap();
                        // Safety: Test code.
                        unsafe { std::ptr::write_bytes(block.memory.as_ptr(), round, block.size) };
                        if round % 2 == 1 {
                            pool.deallocate();
                        }
                    }
                    pool.shrink_to_fit();
                    pool.size()
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 4);
        }
    }

    #[test]
    fn test_block_pool_over_virtual_memory() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new(page_size(), VirtualMemoryAllocator);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.size, page_size() - BlockStack::overhead());
        assert_eq!(b.size, 2 * page_size() - BlockStack::overhead());
        // Safety: Test code; both blocks are committed.
        unsafe {
            std::ptr::write_bytes(a.memory.as_ptr(), 1, a.size);
            std::ptr::write_bytes(b.memory.as_ptr(), 2, b.size);
        }

        pool.deallocate();
        let again = pool.allocate().unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn test_block_pool_over_type_erased_upstream() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = make_thread_safe_allocator(HeapAllocator);
        let info = heap.info();
        {
            let erased = make_any_allocator_reference(&mut heap);
            let mut pool = BlockPool::new(1024, erased);
            let block = pool.allocate().unwrap();
            assert!(block.size > 0);
            assert_eq!(pool.allocator().info(), info);
        }

        let mut stateless = make_stateless_reference::<HeapAllocator>();
        let erased: AnyAllocatorReference<'_> =
            AllocatorHandle::new(TypeErased::new(AnyAllocator::from_mut(&mut stateless)));
        let mut pool = BlockPool::new(64, erased);
        pool.allocate().unwrap();
        pool.deallocate();
        pool.shrink_to_fit();
    }

    #[test]
    fn test_block_pool_upstream_bound_is_checked_first() {
        static PASSED: crate::sync::atomic::AtomicUsize = crate::sync::atomic::AtomicUsize::new(0);
        fn record(_info: &AllocatorInfo, passed: usize, _supported: usize) {
            PASSED.store(passed, crate::sync::atomic::Ordering::SeqCst);
        }

        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let previous = set_bad_allocation_size_handler(Some(record));

        let huge = HeapAllocator.max_array_size() + 1;
        let mut pool = BlockPool::new(huge, HeapAllocator);
        let before = stats::snapshot();
        let first = pool.allocate();
        let after = stats::snapshot();

        set_bad_allocation_size_handler(Some(previous));
        assert_eq!(pool.size(), 0);
        assert_eq!(before.heap_outstanding, after.heap_outstanding);
        assert_eq!(before.block_pool_reserved, after.block_pool_reserved);
        match first {
            Err(AllocError::BadAllocationSize(bad)) => {
                assert_eq!(bad.passed_value(), huge);
                assert_eq!(bad.supported_value(), huge - 1);
            }
            other => panic!("expected a size error, got {other:?}"),
        }
        assert_eq!(PASSED.load(crate::sync::atomic::Ordering::SeqCst), huge);
    }

    #[test]
    fn test_pools_return_everything_to_the_heap() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let baseline = stats::snapshot();
        {
            let mut pool = BlockPool::new(300, HeapAllocator);
            for _ in 0..5 {
                pool.allocate().unwrap();
            }
            pool.deallocate();
            pool.deallocate();
            let mid = stats::snapshot();
            assert!(mid.heap_outstanding > baseline.heap_outstanding);
            assert!(mid.block_pool_cached > baseline.block_pool_cached);
        }
        let after = stats::snapshot();
        assert_eq!(after, baseline);
        assert_eq!(report_leaks(), baseline.heap_outstanding);
    }

    #[test]
    fn test_size_classes_over_block_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new(4096, HeapAllocator);
        let block = pool.allocate().unwrap();

        // Carve one node per size class out of a single block.
        let mut offset = 0;
        for size in [1, 3, 8, 17, 100, 500] {
            let class = Log2Policy::size_from_index(Log2Policy::index_from_size(size));
            assert!(class >= size);
            assert!(block.contains(block.memory.as_ptr().wrapping_add(offset)));
            offset += class;
        }
        assert!(offset <= block.size);
        pool.deallocate_used_to(block.memory.as_ptr());
        assert_eq!(pool.size(), 0);
    }
}
