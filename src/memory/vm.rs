use super::debugging::get_invalid_pointer_handler;
use super::error::{AllocError, AllocatorInfo, OutOfMemory, check_allocation_size};
use super::stats;
use super::traits::RawAllocator;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{PlatformVmOps, VmError, VmOps};
    use std::io;
    use std::ptr::NonNull;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&size| size > 0).unwrap_or(4096)
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps for loom, miri, and platforms without an mmap layer.
//
// Every "reservation" is a page-aligned heap allocation. `commit` is a no-op
// because the memory is accessible as soon as it exists.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// OS page size used by [`VirtualMemoryAllocator`].
#[must_use]
pub fn page_size() -> usize {
    PlatformVmOps::page_size()
}

/// Stateless upstream handing out whole committed pages.
///
/// Every node is its own reservation, so alignment up to the page size comes
/// for free and anything larger is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualMemoryAllocator;

impl VirtualMemoryAllocator {
    fn rounded(size: usize) -> usize {
        size.max(1).next_multiple_of(page_size())
    }
}

impl RawAllocator for VirtualMemoryAllocator {
    const IS_STATEFUL: bool = false;

    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let info = self.info();
        check_allocation_size(size, self.max_node_size(), &info)?;
        check_allocation_size(alignment, self.max_alignment(), &info)?;

        let bytes = Self::rounded(size);
        // Safety: bytes is a non-zero multiple of the page size.
        let memory = unsafe { PlatformVmOps::reserve(bytes) }.map_err(|err| {
            log::debug!("[memory] {err}");
            OutOfMemory::new(info, size)
        })?;
        // Safety: commit covers exactly the range reserved above.
        if let Err(err) = unsafe { PlatformVmOps::commit(memory, bytes) } {
            log::debug!("[memory] {err}");
            // Safety: memory was reserved above and is not used anywhere.
            if let Err(err) = unsafe { PlatformVmOps::release(memory, bytes) } {
                log::warn!("[memory] {err}");
            }
            return Err(OutOfMemory::new(info, size).into());
        }

        stats::VM_COMMITTED.add(bytes);
        Ok(memory)
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, _alignment: usize) {
        if !(node.as_ptr() as usize).is_multiple_of(page_size()) {
            get_invalid_pointer_handler()(&self.info(), node.as_ptr());
            return;
        }

        let bytes = Self::rounded(size);
        // Safety: caller passes a node from allocate_node with the same size.
        match unsafe { PlatformVmOps::release(node, bytes) } {
            Ok(()) => stats::VM_COMMITTED.sub(bytes),
            Err(err) => log::warn!("[memory] {err}"),
        }
    }

    fn max_node_size(&self) -> usize {
        (isize::MAX as usize) & !(page_size() - 1)
    }

    fn max_alignment(&self) -> usize {
        page_size()
    }

    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new("qen_alloc::VirtualMemoryAllocator", 0)
    }
}

impl From<VmError> for std::io::Error {
    fn from(err: VmError) -> Self {
        match err {
            VmError::ReservationFailed(e) | VmError::CommitFailed(e) | VmError::ReleaseFailed(e) => e,
        }
    }
}

impl VirtualMemoryAllocator {
    /// Bytes actually committed for a node of `size` bytes.
    #[must_use]
    pub fn committed_size(size: usize) -> usize {
        Self::rounded(size)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 7;
            assert_eq!(slice[0], 42);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn test_allocator_rounds_to_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut vm = VirtualMemoryAllocator;
        let page = page_size();

        let node = vm.allocate_node(100, 16).unwrap();
        assert!((node.as_ptr() as usize).is_multiple_of(page));
        // Safety: Test code; the whole page is committed.
        unsafe {
            std::ptr::write_bytes(node.as_ptr(), 0x5A, page);
            assert_eq!(*node.as_ptr().add(page - 1), 0x5A);
            vm.deallocate_node(node, 100, 16);
        }
        assert_eq!(VirtualMemoryAllocator::committed_size(100), page);
        assert_eq!(VirtualMemoryAllocator::committed_size(page + 1), 2 * page);
    }

    #[test]
    fn test_allocator_tracks_committed_bytes() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let mut vm = VirtualMemoryAllocator;
        let before = stats::VM_COMMITTED.get();

        let node = vm.allocate_node(3 * page_size(), 1).unwrap();
        assert_eq!(stats::VM_COMMITTED.get(), before + 3 * page_size());

        // Safety: Test code.
        unsafe { vm.deallocate_node(node, 3 * page_size(), 1) };
        assert_eq!(stats::VM_COMMITTED.get(), before);
    }

    #[test]
    fn test_allocator_rejects_oversized_alignment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut vm = VirtualMemoryAllocator;
        let err = vm.allocate_node(8, page_size() * 2).unwrap_err();
        match err {
            AllocError::BadAllocationSize(bad) => {
                assert_eq!(bad.passed_value(), page_size() * 2);
                assert_eq!(bad.supported_value(), page_size());
            }
            AllocError::OutOfMemory(_) => panic!("expected a size error"),
        }
    }

    #[test]
    fn test_allocator_rejects_oversized_node() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut vm = VirtualMemoryAllocator;
        let err = vm.allocate_node(usize::MAX, 1).unwrap_err();
        assert!(matches!(err, AllocError::BadAllocationSize(_)));
    }

    #[test]
    fn test_unaligned_free_reports_invalid_pointer() {
        use crate::memory::debugging::set_invalid_pointer_handler;
        use crate::sync::atomic::{AtomicUsize, Ordering};

        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn record(_info: &AllocatorInfo, _ptr: *const u8) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let previous = set_invalid_pointer_handler(Some(record));

        let mut vm = VirtualMemoryAllocator;
        let node = vm.allocate_node(64, 8).unwrap();
        // Safety: Test code; the handler swallows the bogus pointer before any release.
        unsafe {
            vm.deallocate_node(NonNull::new_unchecked(node.as_ptr().add(8)), 64, 8);
            vm.deallocate_node(node, 64, 8);
        }

        set_invalid_pointer_handler(Some(previous));
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_vm_error_converts_to_io_error() {
        let err = VmError::CommitFailed(std::io::Error::other("boom"));
        assert!(err.to_string().contains("commit"));
        let io: std::io::Error = err.into();
        assert_eq!(io.to_string(), "boom");
    }
}
