//! Process-wide diagnostic hooks and debug pattern fills.
//!
//! Hook slots hold plain function pointers behind an `AtomicPtr`. A null slot
//! means "use the built-in default", so no explicit initialisation is needed
//! and there is nothing to tear down. Readers see either the old or the new
//! hook, never a torn value. Hooks run with no lock held and must tolerate
//! running concurrently with themselves.

use super::error::AllocatorInfo;

/// Declares a hook slot together with its `set_*`/`get_*` accessors.
///
/// `set_*(None)` restores the default and both accessors never return null.
macro_rules! handler_slot {
    (
        $SLOT:ident : $Handler:ty = $default:path;
        $(#[$set_meta:meta])*
        pub fn $set:ident;
        $(#[$get_meta:meta])*
        pub fn $get:ident;
    ) => {
        crate::sync::static_atomic! {
            static $SLOT: crate::sync::atomic::AtomicPtr<()> =
                crate::sync::atomic::AtomicPtr::new(std::ptr::null_mut());
        }

        $(#[$set_meta])*
        pub fn $set(handler: Option<$Handler>) -> $Handler {
            let raw = handler.map_or(std::ptr::null_mut(), |h| h as *mut ());
            let previous = $SLOT.swap(raw, crate::sync::atomic::Ordering::AcqRel);
            if previous.is_null() {
                $default as $Handler
            } else {
                // Safety: only `$Handler` values are ever stored in this slot.
                unsafe { std::mem::transmute::<*mut (), $Handler>(previous) }
            }
        }

        $(#[$get_meta])*
        #[must_use]
        pub fn $get() -> $Handler {
            let current = $SLOT.load(crate::sync::atomic::Ordering::Acquire);
            if current.is_null() {
                $default as $Handler
            } else {
                // Safety: only `$Handler` values are ever stored in this slot.
                unsafe { std::mem::transmute::<*mut (), $Handler>(current) }
            }
        }
    };
}
pub(crate) use handler_slot;

/// Hook run when an allocator is destroyed with memory still outstanding.
pub type LeakHandler = fn(info: &AllocatorInfo, amount: usize);

/// Hook run when a deallocation receives a pointer the allocator never handed out.
pub type InvalidPointerHandler = fn(info: &AllocatorInfo, ptr: *const u8);

/// Hook run when a fence behind `memory` (of `node_size` bytes) was overwritten at `ptr`.
pub type BufferOverflowHandler = fn(memory: *const u8, node_size: usize, ptr: *const u8);

fn default_leak_handler(info: &AllocatorInfo, amount: usize) {
    log::error!("[memory] Allocator {info} leaked {amount} bytes.");
}

fn default_invalid_pointer_handler(info: &AllocatorInfo, ptr: *const u8) {
    log::error!("[memory] Deallocation function of allocator {info} received invalid pointer {ptr:p}");
    std::process::abort();
}

fn default_buffer_overflow_handler(memory: *const u8, node_size: usize, ptr: *const u8) {
    log::error!(
        "[memory] Buffer overflow at address {ptr:p} detected, corresponding memory block {memory:p} has only size {node_size}."
    );
    std::process::abort();
}

handler_slot! {
    LEAK_HANDLER: LeakHandler = default_leak_handler;
    /// Install `handler` as the leak hook; `None` restores the default
    /// (log and continue). Returns the previous hook.
    pub fn set_leak_handler;
    /// The current leak hook.
    pub fn get_leak_handler;
}

handler_slot! {
    INVALID_POINTER_HANDLER: InvalidPointerHandler = default_invalid_pointer_handler;
    /// Install `handler` as the invalid-pointer hook; `None` restores the
    /// default (log and abort). Returns the previous hook.
    pub fn set_invalid_pointer_handler;
    /// The current invalid-pointer hook.
    pub fn get_invalid_pointer_handler;
}

handler_slot! {
    BUFFER_OVERFLOW_HANDLER: BufferOverflowHandler = default_buffer_overflow_handler;
    /// Install `handler` as the buffer-overflow hook; `None` restores the
    /// default (log and abort). Returns the previous hook.
    pub fn set_buffer_overflow_handler;
    /// The current buffer-overflow hook.
    pub fn get_buffer_overflow_handler;
}

/// Byte patterns written over memory in debug builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugMagic {
    /// Fresh memory handed to a user.
    NewMemory = 0xCD,
    /// Memory handed out for an allocator's own use, not yet initialized.
    InternalMemory = 0xAB,
    /// Memory that was given back.
    FreedMemory = 0xDD,
    /// Guard bytes behind a node.
    FenceMemory = 0xFD,
}

/// Overwrite `size` bytes at `memory` with `magic`. No-op in release builds.
///
/// # Safety
/// `memory` must be valid for writes of `size` bytes.
#[inline]
pub unsafe fn debug_fill(memory: *mut u8, size: usize, magic: DebugMagic) {
    #[cfg(debug_assertions)]
    // Safety: upheld by caller.
    unsafe {
        std::ptr::write_bytes(memory, magic as u8, size);
    }
    #[cfg(not(debug_assertions))]
    let _ = (memory, size, magic);
}

/// First byte in `memory[..size]` that differs from `magic`, if any.
///
/// # Safety
/// `memory` must be valid for reads of `size` bytes.
#[must_use]
pub unsafe fn debug_find_mismatch(memory: *const u8, size: usize, magic: DebugMagic) -> Option<*const u8> {
    // Safety: upheld by caller.
    let bytes = unsafe { std::slice::from_raw_parts(memory, size) };
    bytes
        .iter()
        .position(|&b| b != magic as u8)
        // Safety: offset is within the checked range.
        .map(|offset| unsafe { memory.add(offset) })
}
