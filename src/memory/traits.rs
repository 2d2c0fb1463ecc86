use super::error::{AllocError, AllocatorInfo, BadAllocationSize};
use std::ptr::NonNull;

/// Strictest alignment any upstream is asked for by the block machinery.
/// Matches `max_align_t` on the supported targets.
pub const MAX_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

/// The capability set every composable allocation strategy exposes.
///
/// Node operations hand out memory for a single element, array operations
/// for `count` contiguous elements of `size` bytes each. The array defaults
/// forward to the node operations with `count * size` bytes.
///
/// # Stateless allocators
///
/// An allocator that sets `IS_STATEFUL = false` promises that every instance
/// is interchangeable with every other one. Such allocators must be zero-sized;
/// storage policies rely on this to skip locking and to conjure instances on
/// demand. `AllocatorHandle` checks it at construction.
pub trait RawAllocator {
    /// Whether instances carry per-instance state (and thus identity).
    const IS_STATEFUL: bool = true;

    /// Allocate a node of `size` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the underlying resource is exhausted,
    /// `BadAllocationSize` if a bound advertised by the `max_*` queries is exceeded.
    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError>;

    /// Allocate an array of `count` elements of `size` bytes.
    ///
    /// # Errors
    ///
    /// Same as [`allocate_node`](Self::allocate_node). A `count * size` overflow is
    /// reported as `BadAllocationSize`.
    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(total) = count.checked_mul(size) else {
            return Err(BadAllocationSize::new(self.info(), usize::MAX, self.max_array_size()).into());
        };
        self.allocate_node(total, alignment)
    }

    /// Return a node to this allocator.
    ///
    /// # Safety
    /// - `node` must have been returned by `allocate_node` on this allocator
    ///   (or an interchangeable instance, for stateless allocators).
    /// - `size` and `alignment` must match the values passed at allocation.
    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize);

    /// Return an array to this allocator.
    ///
    /// # Safety
    /// Same contract as [`deallocate_node`](Self::deallocate_node), for `allocate_array`.
    unsafe fn deallocate_array(
        &mut self,
        array: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // Safety: forwarded contract; the array was allocated as one node of count * size bytes.
        unsafe { self.deallocate_node(array, count * size, alignment) }
    }

    /// Upper bound on the node size. Requests above it always fail.
    fn max_node_size(&self) -> usize {
        usize::MAX
    }

    /// Upper bound on the total array size in bytes.
    fn max_array_size(&self) -> usize {
        self.max_node_size()
    }

    /// Upper bound on the supported alignment.
    fn max_alignment(&self) -> usize {
        MAX_ALIGNMENT
    }

    /// Identification passed to error and diagnostic hooks.
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::of(std::any::type_name::<Self>(), self)
    }
}

impl<A: RawAllocator + ?Sized> RawAllocator for &mut A {
    const IS_STATEFUL: bool = true;

    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate_node(size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe { (**self).deallocate_node(node, size, alignment) }
    }

    unsafe fn deallocate_array(
        &mut self,
        array: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // Safety: forwarded contract.
        unsafe { (**self).deallocate_array(array, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        (**self).max_node_size()
    }

    fn max_array_size(&self) -> usize {
        (**self).max_array_size()
    }

    fn max_alignment(&self) -> usize {
        (**self).max_alignment()
    }

    fn info(&self) -> AllocatorInfo {
        (**self).info()
    }
}
