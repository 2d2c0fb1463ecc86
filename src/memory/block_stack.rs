//! Intrusive LIFO of raw memory blocks.
//!
//! Each block carries its own header at the front, so the stack never
//! allocates and moving a block between two stacks is a single relink. The
//! stack records blocks but does not own them: whoever pushed a block is
//! responsible for popping it and returning it upstream.

use super::traits::MAX_ALIGNMENT;
use std::ptr::NonNull;

#[repr(C)]
struct BlockHeader {
    prev: Option<NonNull<BlockHeader>>,
    /// Total block size, header included.
    size: usize,
}

/// Bytes taken from the front of every block. Rounded up so the usable part
/// keeps the block's maximal alignment.
const OVERHEAD: usize = std::mem::size_of::<BlockHeader>().next_multiple_of(MAX_ALIGNMENT);

/// An `{address, size}` pair describing (part of) a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub memory: NonNull<u8>,
    pub size: usize,
}

impl MemoryBlock {
    #[must_use]
    pub fn new(memory: NonNull<u8>, size: usize) -> Self {
        Self { memory, size }
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> *const u8 {
        self.memory.as_ptr().wrapping_add(self.size)
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.memory.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }
}

#[derive(Debug, Default)]
pub struct BlockStack {
    head: Option<NonNull<BlockHeader>>,
}

// Safety: the stack only stores addresses of blocks owned by whoever owns the
// stack; nothing is shared behind it.
unsafe impl Send for BlockStack {}

impl BlockStack {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Bytes of bookkeeping embedded in each pushed block.
    #[inline]
    #[must_use]
    pub const fn overhead() -> usize {
        OVERHEAD
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Embed a header at the front of `memory` and make it the new head.
    ///
    /// Advances `memory` past the header and returns the header size.
    ///
    /// # Safety
    /// - `memory` must be valid for reads and writes of `size` bytes and
    ///   aligned to `MAX_ALIGNMENT`.
    /// - The block must stay valid until it is popped again.
    ///
    /// # Panics
    /// If `size` cannot hold the header.
    pub unsafe fn push(&mut self, memory: &mut NonNull<u8>, size: usize) -> usize {
        assert!(size >= OVERHEAD, "block of {size} bytes cannot hold its header");
        let header = memory.cast::<BlockHeader>();
        // Safety: the caller guarantees `size` writable, aligned bytes.
        unsafe {
            header.write(BlockHeader {
                prev: self.head,
                size,
            });
        }
        self.head = Some(header);
        // Safety: OVERHEAD <= size, so this stays within the block.
        *memory = unsafe { memory.add(OVERHEAD) };
        OVERHEAD
    }

    /// Detach the head of `other` and relink it as the head of `self`.
    ///
    /// Returns the usable part of the moved block.
    ///
    /// # Panics
    /// If `other` is empty.
    pub fn transfer_from(&mut self, other: &mut BlockStack) -> MemoryBlock {
        let top = other.head_or_underflow();
        // Safety: every header on a stack was written by `push` and is still valid.
        let header = unsafe { &mut *top.as_ptr() };
        other.head = header.prev;
        header.prev = self.head;
        self.head = Some(top);
        Self::usable(top, header.size)
    }

    /// Detach the head. The returned block starts at the header and carries
    /// the total size originally passed to `push`.
    ///
    /// # Panics
    /// If the stack is empty.
    pub fn pop(&mut self) -> MemoryBlock {
        let top = self.head_or_underflow();
        // Safety: every header on a stack was written by `push` and is still valid.
        let header = unsafe { top.as_ptr().read() };
        self.head = header.prev;
        MemoryBlock::new(top.cast(), header.size)
    }

    /// Usable part of the head block.
    ///
    /// # Panics
    /// If the stack is empty.
    #[must_use]
    pub fn top(&self) -> MemoryBlock {
        let top = self.head_or_underflow();
        // Safety: every header on a stack was written by `push` and is still valid.
        let size = unsafe { (*top.as_ptr()).size };
        Self::usable(top, size)
    }

    /// Number of blocks, by walking the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            count += 1;
            // Safety: every header on a stack was written by `push` and is still valid.
            cursor = unsafe { (*node.as_ptr()).prev };
        }
        count
    }

    fn head_or_underflow(&self) -> NonNull<BlockHeader> {
        match self.head {
            Some(head) => head,
            None => panic!("stack underflow"),
        }
    }

    fn usable(header: NonNull<BlockHeader>, size: usize) -> MemoryBlock {
        // Safety: push asserted size >= OVERHEAD.
        let memory = unsafe { header.cast::<u8>().add(OVERHEAD) };
        MemoryBlock::new(memory, size - OVERHEAD)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::alloc::Layout;

    struct TestBlock {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl TestBlock {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, MAX_ALIGNMENT).unwrap();
            // Safety: Test code, non-zero size.
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            // Safety: Test code.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_push_advances_pointer() {
        let block = TestBlock::new(256);
        let mut stack = BlockStack::new();
        let mut memory = block.ptr;

        // Safety: Test code.
        let offset = unsafe { stack.push(&mut memory, 256) };
        assert_eq!(offset, BlockStack::overhead());
        assert_eq!(memory.as_ptr() as usize, block.ptr.as_ptr() as usize + offset);
        assert_eq!(memory.as_ptr() as usize % MAX_ALIGNMENT, 0);

        let top = stack.top();
        assert_eq!(top.memory, memory);
        assert_eq!(top.size, 256 - offset);

        let popped = stack.pop();
        assert_eq!(popped.memory, block.ptr);
        assert_eq!(popped.size, 256);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_lifo_order() {
        let a = TestBlock::new(128);
        let b = TestBlock::new(512);
        let mut stack = BlockStack::new();

        // Safety: Test code.
        unsafe {
            stack.push(&mut { a.ptr }, 128);
            stack.push(&mut { b.ptr }, 512);
        }
        assert_eq!(stack.len(), 2);

        let first = stack.pop();
        let second = stack.pop();
        assert_eq!(first, MemoryBlock::new(b.ptr, 512));
        assert_eq!(second, MemoryBlock::new(a.ptr, 128));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_transfer_relinks_without_copy() {
        let a = TestBlock::new(128);
        let b = TestBlock::new(256);
        let mut used = BlockStack::new();
        let mut free = BlockStack::new();

        // Safety: Test code.
        unsafe {
            used.push(&mut { a.ptr }, 128);
            used.push(&mut { b.ptr }, 256);
        }

        let moved = free.transfer_from(&mut used);
        assert_eq!(moved.size, 256 - BlockStack::overhead());
        assert_eq!(moved.memory.as_ptr() as usize, b.ptr.as_ptr() as usize + BlockStack::overhead());
        assert_eq!(used.len(), 1);
        assert_eq!(free.len(), 1);
        assert_eq!(used.top().size, 128 - BlockStack::overhead());
        assert_eq!(free.top(), moved);

        // And back again: same block, same usable size.
        let back = used.transfer_from(&mut free);
        assert_eq!(back, moved);
        assert!(free.is_empty());

        used.pop();
        used.pop();
    }

    #[test]
    #[should_panic(expected = "stack underflow")]
    fn test_pop_empty_panics() {
        let mut stack = BlockStack::new();
        let _ = stack.pop();
    }

    #[test]
    #[should_panic(expected = "stack underflow")]
    fn test_top_empty_panics() {
        let stack = BlockStack::new();
        let _ = stack.top();
    }

    #[test]
    #[should_panic(expected = "stack underflow")]
    fn test_transfer_from_empty_panics() {
        let mut a = BlockStack::new();
        let mut b = BlockStack::new();
        let _ = a.transfer_from(&mut b);
    }

    #[test]
    #[should_panic(expected = "cannot hold its header")]
    fn test_push_too_small_panics() {
        let block = TestBlock::new(64);
        let mut stack = BlockStack::new();
        // Safety: Test code; panics before writing.
        unsafe { stack.push(&mut { block.ptr }, BlockStack::overhead() - 1) };
    }

    #[test]
    fn test_memory_block_contains() {
        let block = TestBlock::new(64);
        let mb = MemoryBlock::new(block.ptr, 64);
        assert!(mb.contains(block.ptr.as_ptr()));
        assert!(mb.contains(block.ptr.as_ptr().wrapping_add(63)));
        assert!(!mb.contains(mb.end()));
    }
}
