//! Binding to the externally supplied primitive allocator.

use std::ffi::c_void;

use heapwrap_core::{DerivedOps, PrimitiveAllocator};

use crate::build_config::INTERIOR_FREE;

include!(concat!(env!("OUT_DIR"), "/primitive_bindings.rs"));

/// The primitive named by the build-time prefix.
pub(crate) struct ExternPrimitive;

// SAFETY: the external allocator is required to honor the primitive contract
// (thread-safe, usable size never below the request, lock quiesces it).
unsafe impl PrimitiveAllocator for ExternPrimitive {
    #[inline]
    fn allocate(&self, size: usize) -> *mut u8 {
        // SAFETY: plain C call with no preconditions.
        unsafe { primitive_allocate(size) }.cast()
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: forwarded contract.
        unsafe { primitive_deallocate(ptr.cast()) }
    }

    #[inline]
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        // SAFETY: forwarded contract.
        unsafe { primitive_usable_size(ptr.cast()) }
    }

    fn lock(&self) {
        // SAFETY: plain C call with no preconditions.
        unsafe { primitive_lock() }
    }

    fn unlock(&self) {
        // SAFETY: only reached after lock() on the fork path.
        unsafe { primitive_unlock() }
    }

    fn accepts_interior_pointers(&self) -> bool {
        INTERIOR_FREE
    }
}

/// The process-wide derived layer behind every entry point.
pub(crate) static OPS: DerivedOps<ExternPrimitive> = DerivedOps::new(ExternPrimitive);
