//! Stateless upstream over the global Rust heap.
//!
//! Debug builds place `FENCE_SIZE` guard bytes behind every node and check
//! them when the node comes back. Outstanding bytes are counted in
//! [`stats::HEAP_OUTSTANDING`] so [`report_leaks`] can complain at shutdown.

use super::debugging::{DebugMagic, debug_fill, debug_find_mismatch, get_buffer_overflow_handler, get_leak_handler};
use super::error::{AllocError, AllocatorInfo, BadAllocationSize, OutOfMemory, check_allocation_size};
use super::stats;
use super::traits::{MAX_ALIGNMENT, RawAllocator};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Guard bytes behind every node.
pub const FENCE_SIZE: usize = if cfg!(debug_assertions) { MAX_ALIGNMENT } else { 0 };

/// Largest alignment the heap upstream promises to honour.
const HEAP_MAX_ALIGNMENT: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapAllocator;

impl HeapAllocator {
    fn layout(size: usize, alignment: usize) -> Result<Layout, BadAllocationSize> {
        Layout::from_size_align(size.max(1) + FENCE_SIZE, alignment)
            .map_err(|_| BadAllocationSize::new(HeapAllocator.info(), alignment, HEAP_MAX_ALIGNMENT))
    }
}

impl RawAllocator for HeapAllocator {
    const IS_STATEFUL: bool = false;

    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let info = self.info();
        check_allocation_size(size, self.max_node_size(), &info)?;
        check_allocation_size(alignment, self.max_alignment(), &info)?;
        let layout = Self::layout(size, alignment)?;

        // Safety: layout has a non-zero size.
        let memory = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or_else(|| OutOfMemory::new(info, size))?;

        // Safety: the allocation spans `size.max(1) + FENCE_SIZE` bytes.
        unsafe {
            debug_fill(memory.as_ptr(), size, DebugMagic::NewMemory);
            debug_fill(memory.as_ptr().add(size), FENCE_SIZE, DebugMagic::FenceMemory);
        }
        stats::HEAP_OUTSTANDING.add(size);
        Ok(memory)
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: caller passes a node from allocate_node with the same size,
        // so the fence lies within the allocation.
        let overflow = unsafe { debug_find_mismatch(node.as_ptr().add(size), FENCE_SIZE, DebugMagic::FenceMemory) };
        if let Some(bad) = overflow {
            get_buffer_overflow_handler()(node.as_ptr(), size, bad);
        }

        // Safety: same size and alignment were accepted by allocate_node.
        unsafe {
            debug_fill(node.as_ptr(), size, DebugMagic::FreedMemory);
            let layout = Layout::from_size_align_unchecked(size.max(1) + FENCE_SIZE, alignment);
            std::alloc::dealloc(node.as_ptr(), layout);
        }
        stats::HEAP_OUTSTANDING.sub(size);
    }

    fn max_node_size(&self) -> usize {
        // Room for the fence and the worst-case alignment padding Layout checks for.
        isize::MAX as usize - FENCE_SIZE - HEAP_MAX_ALIGNMENT
    }

    fn max_alignment(&self) -> usize {
        HEAP_MAX_ALIGNMENT
    }

    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new("qen_alloc::HeapAllocator", 0)
    }
}

/// Fire the leak handler if any heap bytes are still outstanding.
///
/// Returns the outstanding amount. Meant to be called once at shutdown, after
/// every allocator built on the heap is gone.
pub fn report_leaks() -> usize {
    let outstanding = stats::HEAP_OUTSTANDING.get();
    if outstanding > 0 {
        get_leak_handler()(&HeapAllocator.info(), outstanding);
    }
    outstanding
}
