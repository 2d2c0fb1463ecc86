pub(crate) mod sync;

// public module: allocator plumbing, diagnostics and TEST_MUTEX (public for tests)
pub mod memory;

// contract + errors
pub use memory::error::{
    AllocError, AllocatorInfo, BadAllocationSize, OutOfMemory, check_allocation_size,
    get_bad_allocation_size_handler, get_out_of_memory_handler, set_bad_allocation_size_handler,
    set_out_of_memory_handler,
};
pub use memory::traits::{MAX_ALIGNMENT, RawAllocator};

// diagnostics
pub use memory::debugging::{
    DebugMagic, get_buffer_overflow_handler, get_invalid_pointer_handler, get_leak_handler,
    set_buffer_overflow_handler, set_invalid_pointer_handler, set_leak_handler,
};

// block management
pub use memory::block_pool::BlockPool;
pub use memory::block_stack::{BlockStack, MemoryBlock};
pub use memory::size_class::{Log2Policy, MAX_CLASS_SIZE, SizeClassPolicy};

// composition
pub use memory::erased::{AnyAllocator, TypeErased};
pub use memory::handle::{
    AllocatorAdapter, AllocatorHandle, AllocatorReference, AnyAllocatorReference, LockedAllocator,
    StatelessAllocatorReference, ThreadSafeAllocator, make_allocator_adapter, make_allocator_reference,
    make_any_allocator_reference, make_stateless_reference, make_thread_safe_allocator,
};
pub use memory::lock::{DefaultMutex, NoLock, RawLock, SyncLock};
pub use memory::storage::{Direct, Reference, StatelessReference, StoragePolicy};

// upstreams + stats
pub use memory::heap::HeapAllocator;
pub use memory::stats::MemoryStats;
pub use memory::vm::{VirtualMemoryAllocator, VmError};
