//! Ways an `AllocatorHandle` can hold on to its allocator.
//!
//! A storage policy hands out access to the allocator through `get`. The
//! returned value derefs to the allocator and is either a borrow of a stored
//! instance or, for stateless allocators, a freshly conjured one.

use super::traits::RawAllocator;
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Access to an allocator obtained from a storage policy.
pub trait AllocatorRef<'a, A: RawAllocator>: DerefMut<Target = A> {
    /// Give up the access, keeping only an address that stays valid for `'a`.
    fn into_raw(self) -> NonNull<A>;
}

impl<'a, A: RawAllocator> AllocatorRef<'a, A> for &'a mut A {
    fn into_raw(self) -> NonNull<A> {
        NonNull::from(self)
    }
}

/// A stateless allocator conjured on demand.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fresh<A>(A);

impl<A> Deref for Fresh<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.0
    }
}

impl<A> DerefMut for Fresh<A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.0
    }
}

impl<'a, A: RawAllocator> AllocatorRef<'a, A> for Fresh<A> {
    fn into_raw(self) -> NonNull<A> {
        const { assert!(std::mem::size_of::<A>() == 0, "stateless allocators must be zero-sized") };
        std::mem::forget(self);
        // Any aligned non-null address is a valid place for a zero-sized value.
        NonNull::dangling()
    }
}

/// How an allocator is held.
pub trait StoragePolicy {
    type Allocator: RawAllocator;

    type Ref<'s>: AllocatorRef<'s, Self::Allocator>
    where
        Self: 's;

    /// Access the allocator.
    ///
    /// # Safety
    /// If `Self::Allocator::IS_STATEFUL`, no other value returned by `get` on
    /// this storage may be alive until the returned one is dropped.
    unsafe fn get(&self) -> Self::Ref<'_>;
}

/// Policies that can be built from another policy's allocator access.
pub trait FromAllocatorRef<'a, A: RawAllocator>: StoragePolicy + Sized {
    fn from_allocator_ref<R: AllocatorRef<'a, A>>(allocator: R) -> Self;
}

/// Owns the allocator inline. Moving the storage moves the allocator.
pub struct Direct<A> {
    cell: UnsafeCell<A>,
}

impl<A: RawAllocator> Direct<A> {
    #[must_use]
    pub fn new(allocator: A) -> Self {
        Self {
            cell: UnsafeCell::new(allocator),
        }
    }

    pub fn get_mut(&mut self) -> &mut A {
        // Safety: `&mut self` is exclusive.
        unsafe_cell_get_mut!(self.cell)
    }

    pub fn into_inner(self) -> A {
        self.cell.into_inner()
    }
}

impl<A: RawAllocator + Default> Default for Direct<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: RawAllocator + Clone> Clone for Direct<A> {
    /// Callers sharing the storage across threads must hold the handle's lock.
    fn clone(&self) -> Self {
        // Safety: Direct is !Sync, so the only concurrent access would come
        // through a handle, which clones under its lock. The borrow is shared
        // and ends before `new` returns.
        let allocator: &A = unsafe_cell_get!(self.cell);
        Self::new(allocator.clone())
    }
}

impl<A: RawAllocator> StoragePolicy for Direct<A> {
    type Allocator = A;
    type Ref<'s>
        = &'s mut A
    where
        Self: 's;

    unsafe fn get(&self) -> &mut A {
        // Safety: exclusivity is upheld by the caller.
        unsafe_cell_get_mut!(self.cell)
    }
}

/// Borrows a stateful allocator owned elsewhere.
pub struct Reference<'a, A> {
    allocator: NonNull<A>,
    _marker: PhantomData<&'a mut A>,
}

// Safety: behaves like the `&'a mut A` it was built from.
unsafe impl<A: Send> Send for Reference<'_, A> {}

impl<'a, A: RawAllocator> Reference<'a, A> {
    #[must_use]
    pub fn new(allocator: &'a mut A) -> Self {
        Self {
            allocator: NonNull::from(allocator),
            _marker: PhantomData,
        }
    }
}

impl<A: RawAllocator> StoragePolicy for Reference<'_, A> {
    type Allocator = A;
    type Ref<'s>
        = &'s mut A
    where
        Self: 's;

    unsafe fn get(&self) -> &mut A {
        // Safety: the pointer came from a `&'a mut A` that outlives `self`;
        // exclusivity is upheld by the caller.
        unsafe { &mut *self.allocator.as_ptr() }
    }
}

impl<'a, A: RawAllocator + 'a> FromAllocatorRef<'a, A> for Reference<'a, A> {
    fn from_allocator_ref<R: AllocatorRef<'a, A>>(allocator: R) -> Self {
        Self {
            allocator: allocator.into_raw(),
            _marker: PhantomData,
        }
    }
}

/// Stores nothing; every `get` returns a new default instance.
pub struct StatelessReference<A> {
    _marker: PhantomData<fn() -> A>,
}

impl<A: RawAllocator + Default> StatelessReference<A> {
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(!A::IS_STATEFUL, "StatelessReference needs a stateless allocator");
            assert!(std::mem::size_of::<A>() == 0, "stateless allocators must be zero-sized");
        };
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A: RawAllocator + Default> Default for StatelessReference<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for StatelessReference<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for StatelessReference<A> {}

impl<A: RawAllocator + Default> StoragePolicy for StatelessReference<A> {
    type Allocator = A;
    type Ref<'s>
        = Fresh<A>
    where
        Self: 's;

    unsafe fn get(&self) -> Fresh<A> {
        Fresh(A::default())
    }
}

impl<'a, A: RawAllocator + Default> FromAllocatorRef<'a, A> for StatelessReference<A> {
    fn from_allocator_ref<R: AllocatorRef<'a, A>>(allocator: R) -> Self {
        drop(allocator);
        Self::new()
    }
}
