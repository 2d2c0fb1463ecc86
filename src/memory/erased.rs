//! Type-erased allocator references.
//!
//! [`AnyAllocator`] stores a small wrapper around some concrete allocator in a
//! fixed inline buffer next to a table of function pointers, in the same
//! spirit as `RawWakerVTable`. No heap allocation is involved. Every wrapper
//! is at most one pointer wide, which is checked at compile time for each
//! instantiation.
//!
//! Clones copy the wrapper and therefore refer to the same allocator. That
//! sharing is only sound on a single thread, so `AnyAllocator` is neither
//! `Send` nor `Sync`.

use super::error::{AllocError, AllocatorInfo};
use super::handle::AllocatorHandle;
use super::lock::SyncLock;
use super::storage::{AllocatorRef, FromAllocatorRef, StoragePolicy};
use super::traits::RawAllocator;
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

type Buffer = MaybeUninit<[usize; 1]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Query {
    NodeSize,
    ArraySize,
    Alignment,
}

/// Function table for one wrapper type. `data` points at the wrapper inside
/// the buffer.
struct ErasedVTable {
    /// `count == 1` means a node.
    allocate: unsafe fn(data: *const (), count: usize, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError>,
    deallocate: unsafe fn(data: *const (), ptr: NonNull<u8>, count: usize, size: usize, alignment: usize),
    max: unsafe fn(data: *const (), query: Query) -> usize,
    info: unsafe fn(data: *const ()) -> AllocatorInfo,
}

/// A wrapper that can live in the buffer.
trait Erased: Copy {
    fn with<R>(self, f: impl FnOnce(&mut dyn ErasedCall) -> R) -> R;

    fn info(self) -> AllocatorInfo {
        self.with(|a| a.erased_info())
    }

    const VTABLE: &'static ErasedVTable = &ErasedVTable {
        allocate: allocate_impl::<Self>,
        deallocate: deallocate_impl::<Self>,
        max: max_impl::<Self>,
        info: info_impl::<Self>,
    };
}

/// The calls the vtable dispatches, object-safe.
trait ErasedCall {
    fn erased_allocate(&mut self, count: usize, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError>;
    unsafe fn erased_deallocate(&mut self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize);
    fn erased_max(&self, query: Query) -> usize;
    fn erased_info(&self) -> AllocatorInfo;
}

impl<A: RawAllocator> ErasedCall for A {
    fn erased_allocate(&mut self, count: usize, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        if count == 1 {
            self.allocate_node(size, alignment)
        } else {
            self.allocate_array(count, size, alignment)
        }
    }

    unsafe fn erased_deallocate(&mut self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        // Safety: forwarded contract.
        unsafe {
            if count == 1 {
                self.deallocate_node(ptr, size, alignment);
            } else {
                self.deallocate_array(ptr, count, size, alignment);
            }
        }
    }

    fn erased_max(&self, query: Query) -> usize {
        match query {
            Query::NodeSize => self.max_node_size(),
            Query::ArraySize => self.max_array_size(),
            Query::Alignment => self.max_alignment(),
        }
    }

    fn erased_info(&self) -> AllocatorInfo {
        RawAllocator::info(self)
    }
}

/// Points at an allocator borrowed mutably for the erased lifetime.
struct ErasedRef<A>(NonNull<A>);

impl<A> Clone for ErasedRef<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for ErasedRef<A> {}

impl<A: RawAllocator> Erased for ErasedRef<A> {
    fn with<R>(self, f: impl FnOnce(&mut dyn ErasedCall) -> R) -> R {
        // Safety: built from an exclusive borrow that outlives every clone,
        // and clones never leave the thread, so calls cannot overlap.
        f(unsafe { &mut *self.0.as_ptr() })
    }
}

/// Holds an allocator by value. Every call runs on a fresh copy, so `R` is
/// either stateless or a shared reference to a thread-safe handle, whose
/// state lives behind the reference.
#[derive(Clone, Copy)]
struct ErasedValue<R>(R);

impl<R: RawAllocator + Copy> Erased for ErasedValue<R> {
    fn with<T>(self, f: impl FnOnce(&mut dyn ErasedCall) -> T) -> T {
        let mut allocator = self.0;
        f(&mut allocator)
    }

    fn info(self) -> AllocatorInfo {
        let info = self.with(|a| a.erased_info());
        if R::IS_STATEFUL {
            info
        } else {
            // The copy is a temporary; its address says nothing.
            AllocatorInfo::new(info.name, 0)
        }
    }
}

unsafe fn allocate_impl<W: Erased>(
    data: *const (),
    count: usize,
    size: usize,
    alignment: usize,
) -> Result<NonNull<u8>, AllocError> {
    // Safety: `data` points at a `W` written by `AnyAllocator::erase`.
    let wrapper = unsafe { data.cast::<W>().read() };
    wrapper.with(|a| a.erased_allocate(count, size, alignment))
}

unsafe fn deallocate_impl<W: Erased>(
    data: *const (),
    ptr: NonNull<u8>,
    count: usize,
    size: usize,
    alignment: usize,
) {
    // Safety: `data` points at a `W` written by `AnyAllocator::erase`.
    let wrapper = unsafe { data.cast::<W>().read() };
    // Safety: forwarded contract.
    wrapper.with(|a| unsafe { a.erased_deallocate(ptr, count, size, alignment) });
}

unsafe fn max_impl<W: Erased>(data: *const (), query: Query) -> usize {
    // Safety: `data` points at a `W` written by `AnyAllocator::erase`.
    let wrapper = unsafe { data.cast::<W>().read() };
    wrapper.with(|a| a.erased_max(query))
}

unsafe fn info_impl<W: Erased>(data: *const ()) -> AllocatorInfo {
    // Safety: `data` points at a `W` written by `AnyAllocator::erase`.
    let wrapper = unsafe { data.cast::<W>().read() };
    wrapper.info()
}

/// A reference to any allocator, behind a fixed-size inline buffer.
///
/// Always stateful: it has the identity of whatever it refers to, which
/// [`info`](RawAllocator::info) reports.
pub struct AnyAllocator<'a> {
    buffer: Buffer,
    vtable: &'static ErasedVTable,
    _marker: PhantomData<(&'a mut (), *mut ())>,
}

impl<'a> AnyAllocator<'a> {
    /// Refer to `allocator` for `'a`.
    pub fn from_mut<A: RawAllocator + 'a>(allocator: &'a mut A) -> Self {
        Self::erase(ErasedRef(NonNull::from(allocator)))
    }

    /// Hold a stateless allocator by value.
    ///
    /// Stateful allocators must go through [`from_mut`](Self::from_mut) or
    /// [`from_shared`](Self::from_shared); holding one by value would lose
    /// its state after every call.
    ///
    /// ```compile_fail
    /// use qen_alloc::{AllocError, AnyAllocator, RawAllocator};
    /// use std::ptr::NonNull;
    ///
    /// #[derive(Clone, Copy)]
    /// struct Bump(usize);
    ///
    /// impl RawAllocator for Bump {
    ///     fn allocate_node(&mut self, size: usize, _: usize) -> Result<NonNull<u8>, AllocError> {
    ///         self.0 += size;
    ///         Ok(NonNull::dangling())
    ///     }
    ///     unsafe fn deallocate_node(&mut self, _: NonNull<u8>, _: usize, _: usize) {}
    /// }
    ///
    /// let _ = AnyAllocator::from_value(Bump(0));
    /// ```
    pub fn from_value<R: RawAllocator + Copy + 'a>(allocator: R) -> Self {
        const { assert!(!R::IS_STATEFUL, "stateful allocators cannot be held by value") };
        Self::erase(ErasedValue(allocator))
    }

    /// Refer to a thread-safe handle shared with other users for `'a`.
    pub fn from_shared<S: StoragePolicy + 'a, M: SyncLock + 'a>(handle: &'a AllocatorHandle<S, M>) -> Self {
        Self::erase(ErasedValue(handle))
    }

    fn erase<W: Erased + 'a>(wrapper: W) -> Self {
        const {
            assert!(
                std::mem::size_of::<W>() <= std::mem::size_of::<Buffer>()
                    && std::mem::align_of::<W>() <= std::mem::align_of::<Buffer>(),
                "allocator wrapper does not fit the type-erased buffer"
            );
            assert!(!std::mem::needs_drop::<W>(), "allocator wrapper must not need drop");
        };
        let mut buffer = Buffer::uninit();
        // Safety: size and alignment checked above.
        unsafe { buffer.as_mut_ptr().cast::<W>().write(wrapper) };
        Self {
            buffer,
            vtable: W::VTABLE,
            _marker: PhantomData,
        }
    }

    fn data(&self) -> *const () {
        self.buffer.as_ptr().cast()
    }
}

impl Clone for AnyAllocator<'_> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer,
            vtable: self.vtable,
            _marker: PhantomData,
        }
    }
}

impl std::fmt::Debug for AnyAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AnyAllocator").field(&self.info()).finish()
    }
}

impl RawAllocator for AnyAllocator<'_> {
    fn allocate_node(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety: the buffer holds the wrapper the vtable was made for.
        unsafe { (self.vtable.allocate)(self.data(), 1, size, alignment) }
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: as above.
        unsafe { (self.vtable.allocate)(self.data(), count, size, alignment) }
    }

    unsafe fn deallocate_node(&mut self, node: NonNull<u8>, size: usize, alignment: usize) {
        // Safety: as above; caller upholds the deallocation contract.
        unsafe { (self.vtable.deallocate)(self.data(), node, 1, size, alignment) }
    }

    unsafe fn deallocate_array(
        &mut self,
        array: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // Safety: as above; caller upholds the deallocation contract.
        unsafe { (self.vtable.deallocate)(self.data(), array, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        // Safety: as above.
        unsafe { (self.vtable.max)(self.data(), Query::NodeSize) }
    }

    fn max_array_size(&self) -> usize {
        // Safety: as above.
        unsafe { (self.vtable.max)(self.data(), Query::ArraySize) }
    }

    fn max_alignment(&self) -> usize {
        // Safety: as above.
        unsafe { (self.vtable.max)(self.data(), Query::Alignment) }
    }

    fn info(&self) -> AllocatorInfo {
        // Safety: as above.
        unsafe { (self.vtable.info)(self.data()) }
    }
}

/// Storage policy holding an [`AnyAllocator`].
pub struct TypeErased<'a> {
    cell: UnsafeCell<AnyAllocator<'a>>,
}

impl<'a> TypeErased<'a> {
    #[must_use]
    pub fn new(allocator: AnyAllocator<'a>) -> Self {
        Self {
            cell: UnsafeCell::new(allocator),
        }
    }
}

impl Clone for TypeErased<'_> {
    fn clone(&self) -> Self {
        // Safety: TypeErased is !Send and !Sync; the only other access is an
        // in-flight call on this thread, which never clones the storage.
        let any: &AnyAllocator<'_> = unsafe_cell_get!(self.cell);
        Self::new(any.clone())
    }
}

impl<'a> StoragePolicy for TypeErased<'a> {
    type Allocator = AnyAllocator<'a>;
    type Ref<'s>
        = &'s mut AnyAllocator<'a>
    where
        Self: 's;

    unsafe fn get(&self) -> &mut AnyAllocator<'a> {
        // Safety: exclusivity is upheld by the caller.
        unsafe_cell_get_mut!(self.cell)
    }
}

impl<'a, A: RawAllocator + 'a> FromAllocatorRef<'a, A> for TypeErased<'a> {
    fn from_allocator_ref<R: AllocatorRef<'a, A>>(allocator: R) -> Self {
        // Safety: `into_raw` yields an address valid and unaliased for `'a`.
        let allocator: &'a mut A = unsafe { &mut *allocator.into_raw().as_ptr() };
        Self::new(AnyAllocator::from_mut(allocator))
    }
}
