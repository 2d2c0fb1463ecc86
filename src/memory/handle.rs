//! The composed, outward-facing allocator: a storage policy plus a lock.
//!
//! Every operation takes the lock, obtains the allocator from the storage,
//! forwards the call and unlocks. Handles over stateless allocators never
//! lock, whatever the lock type: stateless allocators have no shared state to
//! protect. [`AllocatorHandle::lock`] keeps the lock held across several
//! operations.

use super::erased::{AnyAllocator, TypeErased};
use super::error::{AllocError, AllocatorInfo};
use super::lock::{DefaultMutex, NoLock, RawLock, SyncLock};
use super::storage::{Direct, FromAllocatorRef, Reference, StatelessReference, StoragePolicy};
use super::traits::RawAllocator;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub struct AllocatorHandle<S: StoragePolicy, M: RawLock = NoLock> {
    storage: S,
    lock: M,
}

// Safety: the storage is only accessed with the lock held, or is stateless.
unsafe impl<S: StoragePolicy + Send, M: SyncLock> Sync for AllocatorHandle<S, M> {}

/// Releases the lock on drop, if one was taken.
struct Guard<'h, M: RawLock>(Option<&'h M>);

impl<M: RawLock> Drop for Guard<'_, M> {
    fn drop(&mut self) {
        if let Some(lock) = self.0 {
            // Safety: taken in `AllocatorHandle::acquire`.
            unsafe { lock.unlock() };
        }
    }
}

impl<S: StoragePolicy, M: RawLock> AllocatorHandle<S, M> {
    /// Wrap `storage`.
    ///
    /// Fails to compile if a stateless allocator is not zero-sized.
    #[must_use]
    pub fn new(storage: S) -> Self {
        const {
            assert!(
                S::Allocator::IS_STATEFUL || std::mem::size_of::<S::Allocator>() == 0,
                "stateless allocators must be zero-sized"
            );
        };
        Self {
            storage,
            lock: M::new(),
        }
    }

    /// Build from another handle with the same lock type by re-deriving its
    /// allocator access. The source stays borrowed for `'a`.
    pub fn from_handle<'a, T>(source: &'a mut AllocatorHandle<T, M>) -> Self
    where
        T: StoragePolicy,
        S: FromAllocatorRef<'a, T::Allocator>,
    {
        Self::new(S::from_allocator_ref(source.get_allocator()))
    }

    /// Whether calls go through the lock.
    #[inline]
    #[must_use]
    pub const fn is_locking() -> bool {
        S::Allocator::IS_STATEFUL
    }

    fn acquire(&self) -> Guard<'_, M> {
        if Self::is_locking() {
            self.lock.lock();
            Guard(Some(&self.lock))
        } else {
            Guard(None)
        }
    }

    fn with_allocator<R>(&self, f: impl FnOnce(&mut S::Allocator) -> R) -> R {
        let _guard = self.acquire();
        // Safety: the lock is held for stateful allocators; stateless ones
        // are zero-sized and need no exclusivity.
        let mut allocator = unsafe { self.storage.get() };
        f(&mut *allocator)
    }

    /// # Errors
    ///
    /// Whatever the allocator reports.
    pub fn allocate_node(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_allocator(|a| a.allocate_node(size, alignment))
    }

    /// # Errors
    ///
    /// Whatever the allocator reports.
    pub fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.with_allocator(|a| a.allocate_array(count, size, alignment))
    }

    /// # Safety
    /// See [`RawAllocator::deallocate_node`].
    pub unsafe fn deallocate_node(&self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        self.with_allocator(|a| unsafe { a.deallocate_node(node, size, alignment) });
    }

    /// # Safety
    /// See [`RawAllocator::deallocate_array`].
    pub unsafe fn deallocate_array(&self, array: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        self.with_allocator(|a| unsafe { a.deallocate_array(array, count, size, alignment) });
    }

    #[must_use]
    pub fn max_node_size(&self) -> usize {
        self.with_allocator(|a| a.max_node_size())
    }

    #[must_use]
    pub fn max_array_size(&self) -> usize {
        self.with_allocator(|a| a.max_array_size())
    }

    #[must_use]
    pub fn max_alignment(&self) -> usize {
        self.with_allocator(|a| a.max_alignment())
    }

    /// Info of the held allocator.
    #[must_use]
    pub fn info(&self) -> AllocatorInfo {
        self.with_allocator(|a| a.info())
    }

    /// Direct access to the allocator, without locking.
    pub fn get_allocator(&mut self) -> S::Ref<'_> {
        // Safety: `&mut self` rules out any other access through this handle.
        unsafe { self.storage.get() }
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

impl<S: StoragePolicy, M: SyncLock> AllocatorHandle<S, M> {
    /// Take the lock and keep it until the returned view is dropped.
    ///
    /// Calling any other method of this handle on the same thread while the
    /// view is alive deadlocks.
    pub fn lock(&self) -> LockedAllocator<'_, S, M> {
        let guard = self.acquire();
        // Safety: the guard holds the lock (or the allocator is stateless)
        // for as long as the view lives.
        let allocator = unsafe { self.storage.get() };
        LockedAllocator {
            allocator,
            _guard: guard,
            _not_send: PhantomData,
        }
    }
}

impl<S: StoragePolicy + Default, M: RawLock> Default for AllocatorHandle<S, M> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: StoragePolicy + Clone, M: RawLock> Clone for AllocatorHandle<S, M> {
    fn clone(&self) -> Self {
        let storage = {
            let _guard = self.acquire();
            self.storage.clone()
        };
        Self::new(storage)
    }
}

impl<S: StoragePolicy, M: RawLock> std::fmt::Debug for AllocatorHandle<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorHandle")
            .field("allocator", &std::any::type_name::<S::Allocator>())
            .field("locking", &Self::is_locking())
            .finish_non_exhaustive()
    }
}

/// The allocator of a handle, with the handle's lock held.
///
/// Moving the view moves the lock ownership with it. It cannot be cloned,
/// and it stays on the thread that took the lock:
///
/// ```compile_fail
/// use qen_alloc::{HeapAllocator, make_thread_safe_allocator};
///
/// let handle = make_thread_safe_allocator(HeapAllocator);
/// let view = handle.lock();
/// std::thread::scope(|s| {
///     s.spawn(move || drop(view));
/// });
/// ```
pub struct LockedAllocator<'h, S: StoragePolicy + 'h, M: SyncLock> {
    allocator: S::Ref<'h>,
    // Declared last so the allocator access ends before the unlock.
    _guard: Guard<'h, M>,
    // The unlock must run on the locking thread.
    _not_send: PhantomData<*const ()>,
}

impl<'h, S: StoragePolicy + 'h, M: SyncLock> Deref for LockedAllocator<'h, S, M> {
    type Target = S::Allocator;

    fn deref(&self) -> &S::Allocator {
        &*self.allocator
    }
}

impl<'h, S: StoragePolicy + 'h, M: SyncLock> DerefMut for LockedAllocator<'h, S, M> {
    fn deref_mut(&mut self) -> &mut S::Allocator {
        &mut *self.allocator
    }
}

impl<S: StoragePolicy, M: RawLock> RawAllocator for AllocatorHandle<S, M> {
    const IS_STATEFUL: bool = S::Allocator::IS_STATEFUL || std::mem::size_of::<Self>() != 0;

    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        AllocatorHandle::allocate_node(self, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        AllocatorHandle::allocate_array(self, count, size, alignment)
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe { AllocatorHandle::deallocate_node(self, node, size, alignment) }
    }

    unsafe fn deallocate_array(
        &mut self,
        array: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // Safety: forwarded contract.
        unsafe { AllocatorHandle::deallocate_array(self, array, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        AllocatorHandle::max_node_size(self)
    }

    fn max_array_size(&self) -> usize {
        AllocatorHandle::max_array_size(self)
    }

    fn max_alignment(&self) -> usize {
        AllocatorHandle::max_alignment(self)
    }

    fn info(&self) -> AllocatorInfo {
        AllocatorHandle::info(self)
    }
}

/// A shared reference to a thread-safe handle is itself an allocator, so
/// several users (or threads) can share one handle.
impl<S: StoragePolicy, M: SyncLock> RawAllocator for &AllocatorHandle<S, M> {
    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        AllocatorHandle::allocate_node(self, size, alignment)
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        AllocatorHandle::allocate_array(self, count, size, alignment)
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe { AllocatorHandle::deallocate_node(self, node, size, alignment) }
    }

    unsafe fn deallocate_array(
        &mut self,
        array: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // Safety: forwarded contract.
        unsafe { AllocatorHandle::deallocate_array(self, array, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        AllocatorHandle::max_node_size(self)
    }

    fn max_array_size(&self) -> usize {
        AllocatorHandle::max_array_size(self)
    }

    fn max_alignment(&self) -> usize {
        AllocatorHandle::max_alignment(self)
    }

    fn info(&self) -> AllocatorInfo {
        AllocatorHandle::info(self)
    }
}

/// Gives any allocator the handle interface; no locking.
pub type AllocatorAdapter<A> = AllocatorHandle<Direct<A>, NoLock>;

/// Owns an allocator and serialises every call through `M`.
pub type ThreadSafeAllocator<A, M = DefaultMutex> = AllocatorHandle<Direct<A>, M>;

/// Borrows a stateful allocator.
pub type AllocatorReference<'a, A, M = DefaultMutex> = AllocatorHandle<Reference<'a, A>, M>;

/// Refers to a stateless allocator without storing anything.
pub type StatelessAllocatorReference<A, M = NoLock> = AllocatorHandle<StatelessReference<A>, M>;

/// Borrows any allocator through type erasure. Bound to the creating thread.
pub type AnyAllocatorReference<'a, M = NoLock> = AllocatorHandle<TypeErased<'a>, M>;

#[must_use]
pub fn make_allocator_adapter<A: RawAllocator>(allocator: A) -> AllocatorAdapter<A> {
    AllocatorHandle::new(Direct::new(allocator))
}

#[must_use]
pub fn make_thread_safe_allocator<A: RawAllocator>(allocator: A) -> ThreadSafeAllocator<A> {
    AllocatorHandle::new(Direct::new(allocator))
}

#[must_use]
pub fn make_allocator_reference<A: RawAllocator>(allocator: &mut A) -> AllocatorReference<'_, A> {
    AllocatorHandle::new(Reference::new(allocator))
}

#[must_use]
pub fn make_stateless_reference<A: RawAllocator + Default>() -> StatelessAllocatorReference<A> {
    AllocatorHandle::new(StatelessReference::new())
}

#[must_use]
pub fn make_any_allocator_reference<A: RawAllocator>(allocator: &mut A) -> AnyAllocatorReference<'_> {
    AllocatorHandle::new(TypeErased::new(AnyAllocator::from_mut(allocator)))
}
