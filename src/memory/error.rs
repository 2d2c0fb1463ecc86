//! Typed allocation failures and the hooks consulted before they are raised.
//!
//! Both failures run their hook from the constructor. The hook may log or
//! abort; if it returns, the constructed value is handed back to the caller
//! which propagates it. There is no retry loop.

use super::debugging::handler_slot;
use std::fmt;
use thiserror::Error;

/// Identifies an allocator in failures and diagnostics.
///
/// Two infos compare equal iff their `identity` matches; the name is only
/// for display. The identity must never be turned back into a pointer.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorInfo {
    pub name: &'static str,
    pub identity: usize,
}

impl AllocatorInfo {
    #[must_use]
    pub const fn new(name: &'static str, identity: usize) -> Self {
        Self { name, identity }
    }

    /// Info whose identity is the address of `allocator`.
    #[must_use]
    pub fn of<T: ?Sized>(name: &'static str, allocator: &T) -> Self {
        Self::new(name, std::ptr::from_ref(allocator).cast::<()>() as usize)
    }
}

impl PartialEq for AllocatorInfo {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for AllocatorInfo {}

impl std::hash::Hash for AllocatorInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {:#x})", self.name, self.identity)
    }
}

/// Hook run when an allocator runs out of memory.
pub type OutOfMemoryHandler = fn(info: &AllocatorInfo, amount: usize);

/// Hook run when a request exceeds an allocator's advertised bound.
pub type BadAllocationSizeHandler = fn(info: &AllocatorInfo, passed: usize, supported: usize);

fn default_out_of_memory_handler(info: &AllocatorInfo, amount: usize) {
    log::error!("[memory] Allocator {info} ran out of memory trying to allocate {amount} bytes.");
}

fn default_bad_allocation_size_handler(info: &AllocatorInfo, passed: usize, supported: usize) {
    log::error!(
        "[memory] Allocator {info} received invalid size/alignment {passed}, max supported is {supported}."
    );
}

handler_slot! {
    OUT_OF_MEMORY_HANDLER: OutOfMemoryHandler = default_out_of_memory_handler;
    /// Install `handler` as the out-of-memory hook; `None` restores the default.
    /// Returns the previous hook.
    pub fn set_out_of_memory_handler;
    /// The current out-of-memory hook.
    pub fn get_out_of_memory_handler;
}

handler_slot! {
    BAD_ALLOCATION_SIZE_HANDLER: BadAllocationSizeHandler = default_bad_allocation_size_handler;
    /// Install `handler` as the bad-allocation-size hook; `None` restores the default.
    /// Returns the previous hook.
    pub fn set_bad_allocation_size_handler;
    /// The current bad-allocation-size hook.
    pub fn get_bad_allocation_size_handler;
}

/// An upstream resource could not satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("allocator {info} ran out of memory trying to allocate {amount} bytes")]
pub struct OutOfMemory {
    info: AllocatorInfo,
    amount: usize,
}

impl OutOfMemory {
    /// Runs the out-of-memory hook, then builds the failure.
    #[must_use]
    pub fn new(info: AllocatorInfo, amount: usize) -> Self {
        get_out_of_memory_handler()(&info, amount);
        Self { info, amount }
    }

    #[must_use]
    pub fn allocator(&self) -> &AllocatorInfo {
        &self.info
    }

    /// The amount of memory that was requested.
    #[must_use]
    pub fn failed_allocation_size(&self) -> usize {
        self.amount
    }
}

/// A size or alignment exceeded the bound an allocator advertises.
///
/// The supported value is only an upper bound: fences and alignment padding
/// can still make smaller requests fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("allocator {info} received size/alignment {passed}, supported maximum is {supported}")]
pub struct BadAllocationSize {
    info: AllocatorInfo,
    passed: usize,
    supported: usize,
}

impl BadAllocationSize {
    /// Runs the bad-allocation-size hook, then builds the failure.
    #[must_use]
    pub fn new(info: AllocatorInfo, passed: usize, supported: usize) -> Self {
        get_bad_allocation_size_handler()(&info, passed, supported);
        Self {
            info,
            passed,
            supported,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &AllocatorInfo {
        &self.info
    }

    #[must_use]
    pub fn passed_value(&self) -> usize {
        self.passed
    }

    #[must_use]
    pub fn supported_value(&self) -> usize {
        self.supported
    }
}

/// Any failure an allocation can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error(transparent)]
    BadAllocationSize(#[from] BadAllocationSize),
}

impl AllocError {
    /// The allocator that raised the failure.
    #[must_use]
    pub fn allocator(&self) -> &AllocatorInfo {
        match self {
            AllocError::OutOfMemory(e) => e.allocator(),
            AllocError::BadAllocationSize(e) => e.allocator(),
        }
    }
}

/// Reject `passed` before any upstream attempt if it exceeds `supported`.
///
/// # Errors
///
/// `BadAllocationSize` (after running its hook) when `passed > supported`.
pub fn check_allocation_size(
    passed: usize,
    supported: usize,
    info: &AllocatorInfo,
) -> Result<(), BadAllocationSize> {
    if passed > supported {
        return Err(BadAllocationSize::new(*info, passed, supported));
    }
    Ok(())
}
