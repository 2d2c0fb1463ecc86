//! Growing pool of raw memory blocks obtained from an upstream allocator.
//!
//! Blocks are handed out and taken back in LIFO order. A returned block is
//! cached on a free stack instead of going back upstream, so the next request
//! reuses it without an upstream call. Every brand-new block is twice the size
//! of the previous one.
//!
//! The pool tracks blocks, not the nodes carved from them. Dropping it
//! releases every block, so callers must be done with all nodes first. There
//! is no internal locking; wrap the pool (or its upstream) in an
//! `AllocatorHandle` to share it.

use super::block_stack::{BlockStack, MemoryBlock};
use super::debugging::{DebugMagic, debug_fill};
use super::error::{AllocError, check_allocation_size};
use super::stats;
use super::traits::{MAX_ALIGNMENT, RawAllocator};
use log::{debug, trace};

/// Each brand-new block is this many times larger than the previous one.
pub const GROWTH_FACTOR: usize = 2;

pub struct BlockPool<A: RawAllocator> {
    allocator: A,
    used: BlockStack,
    free: BlockStack,
    /// Blocks currently handed out.
    size: usize,
    /// Total size of the next brand-new block, header included.
    block_size: usize,
}

impl<A: RawAllocator> BlockPool<A> {
    /// An empty pool whose first upstream request will be `block_size` bytes.
    ///
    /// # Panics
    /// If `block_size` leaves no usable space after the block header.
    #[must_use]
    pub fn new(block_size: usize, allocator: A) -> Self {
        assert!(
            block_size > BlockStack::overhead(),
            "block size {block_size} must exceed the {} byte block header",
            BlockStack::overhead()
        );
        Self {
            allocator,
            used: BlockStack::new(),
            free: BlockStack::new(),
            size: 0,
            block_size,
        }
    }

    /// Hand out a block, reusing a cached one when available.
    ///
    /// The returned size excludes the block header.
    ///
    /// # Errors
    ///
    /// `BadAllocationSize` if the next block exceeds the upstream's array
    /// bound (checked before any upstream call), or whatever the upstream
    /// reports. Nothing changes on failure.
    pub fn allocate(&mut self) -> Result<MemoryBlock, AllocError> {
        if !self.free.is_empty() {
            let block = self.used.transfer_from(&mut self.free);
            self.size += 1;
            stats::BLOCK_POOL_CACHED.sub(block.size + BlockStack::overhead());
            trace!("block pool reused cached block of {} bytes", block.size);
            // Safety: the block was pushed with at least `block.size` usable bytes.
            unsafe { debug_fill(block.memory.as_ptr(), block.size, DebugMagic::InternalMemory) };
            return Ok(block);
        }

        let total = self.block_size;
        check_allocation_size(total, self.allocator.max_array_size(), &self.allocator.info())?;
        let mut memory = self.allocator.allocate_array(total, 1, MAX_ALIGNMENT)?;
        // Safety: upstream returned `total` bytes with maximal alignment, and
        // the block stays alive until popped in shrink_to_fit or drop.
        let offset = unsafe { self.used.push(&mut memory, total) };
        let usable = total - offset;
        self.size += 1;
        self.block_size = total.saturating_mul(GROWTH_FACTOR);
        stats::BLOCK_POOL_RESERVED.add(total);
        trace!("block pool acquired new block of {total} bytes, next request {}", self.block_size);

        // Safety: `usable` bytes follow the header.
        unsafe { debug_fill(memory.as_ptr(), usable, DebugMagic::InternalMemory) };
        Ok(MemoryBlock::new(memory, usable))
    }

    /// Move the most recently handed out block to the cache.
    ///
    /// # Panics
    /// If no block is handed out.
    pub fn deallocate(&mut self) {
        let block = self.release_top();
        // Safety: the block is cached, still owned by the pool.
        unsafe { debug_fill(block.memory.as_ptr(), block.size, DebugMagic::FreedMemory) };
    }

    /// Like [`deallocate`](Self::deallocate), but only the prefix up to
    /// `used_to` is marked as freed.
    ///
    /// # Panics
    /// If no block is handed out.
    pub fn deallocate_used_to(&mut self, used_to: *const u8) {
        let block = self.release_top();
        debug_assert!(
            block.contains(used_to) || used_to == block.end(),
            "{used_to:p} is not inside the top block"
        );
        let touched = (used_to as usize)
            .saturating_sub(block.memory.as_ptr() as usize)
            .min(block.size);
        // Safety: clamped to the block's usable size.
        unsafe { debug_fill(block.memory.as_ptr(), touched, DebugMagic::FreedMemory) };
    }

    fn release_top(&mut self) -> MemoryBlock {
        let block = self.free.transfer_from(&mut self.used);
        self.size -= 1;
        stats::BLOCK_POOL_CACHED.add(block.size + BlockStack::overhead());
        block
    }

    /// Return every cached block to the upstream. Handed-out blocks are untouched.
    pub fn shrink_to_fit(&mut self) {
        let mut released = 0usize;
        while !self.free.is_empty() {
            let block = self.free.pop();
            stats::BLOCK_POOL_CACHED.sub(block.size);
            stats::BLOCK_POOL_RESERVED.sub(block.size);
            // Safety: the block came from `allocate_array(block.size, 1, MAX_ALIGNMENT)`
            // on this upstream and nothing references it any more.
            unsafe {
                self.allocator
                    .deallocate_array(block.memory, block.size, 1, MAX_ALIGNMENT);
            }
            released += 1;
        }
        if released > 0 {
            trace!("block pool released {released} cached blocks");
        }
    }

    /// The most recently handed out block.
    ///
    /// # Panics
    /// If no block is handed out.
    #[must_use]
    pub fn top(&self) -> MemoryBlock {
        self.used.top()
    }

    /// Usable size the next brand-new block would have.
    #[must_use]
    pub fn next_block_size(&self) -> usize {
        self.block_size - BlockStack::overhead()
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }
}

impl<A: RawAllocator> Drop for BlockPool<A> {
    fn drop(&mut self) {
        self.shrink_to_fit();
        if self.size > 0 {
            debug!("block pool dropped with {} blocks still in use", self.size);
        }
        while !self.used.is_empty() {
            let block = self.used.pop();
            stats::BLOCK_POOL_RESERVED.sub(block.size);
            // Safety: same as in shrink_to_fit.
            unsafe {
                self.allocator
                    .deallocate_array(block.memory, block.size, 1, MAX_ALIGNMENT);
            }
        }
    }
}
