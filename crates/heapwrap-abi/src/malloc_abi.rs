//! ABI layer for the malloc family.
//!
//! Every function delegates to the process-wide derived layer
//! ([`heapwrap_core::DerivedOps`]) over the external primitive. Failures
//! follow the C convention: null plus errno, or a returned error code for
//! `posix_memalign`.
//!
//! Release builds on ELF targets export these under their C names. Darwin
//! reaches them through the interpose table instead, so they keep mangled
//! names there.

use std::ffi::{CStr, c_char, c_int, c_void};

use crate::primitive::OPS;
use crate::util::{into_raw, set_errno};

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    into_raw(OPS.malloc(size))
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // SAFETY: C contract; ptr is null or came from this layer.
    unsafe { OPS.free(ptr.cast()) }
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn vfree(ptr: *mut c_void) {
    // SAFETY: as for free.
    unsafe { OPS.vfree(ptr.cast()) }
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    into_raw(OPS.calloc(count, size))
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: C contract; ptr is null or live.
    into_raw(unsafe { OPS.realloc(ptr.cast(), size) })
}

/// `realloc` that releases the original block when it fails.
#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn reallocf(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: C contract; ptr is null or live.
    into_raw(unsafe { OPS.reallocf(ptr.cast(), size) })
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    // SAFETY: C contract; s is NUL-terminated.
    let s = unsafe { CStr::from_ptr(s) };
    into_raw(OPS.strdup(s)).cast()
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    into_raw(OPS.memalign(alignment, size))
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    into_raw(OPS.aligned_alloc(alignment, size))
}

/// Returns 0, `EINVAL` or `ENOMEM`. `*memptr` is untouched on failure and
/// errno is left alone.
#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    let mut block = std::ptr::null_mut::<u8>();
    match OPS.posix_memalign(&mut block, alignment, size) {
        Ok(()) => {
            // SAFETY: non-null out-pointer supplied by the caller.
            unsafe { *memptr = block.cast() };
            0
        }
        Err(err) => err.errno(),
    }
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    into_raw(OPS.valloc(size))
}

#[cfg_attr(all(not(debug_assertions), not(target_vendor = "apple")), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    // SAFETY: C contract; ptr is null or live.
    unsafe { OPS.usable_size(ptr.cast()) }
}

// Darwin spellings; only reachable through the interpose table.

pub unsafe extern "C" fn malloc_size(ptr: *const c_void) -> usize {
    // SAFETY: C contract; ptr is null or live.
    unsafe { OPS.usable_size(ptr.cast_mut().cast()) }
}

pub unsafe extern "C" fn malloc_good_size(size: usize) -> usize {
    OPS.good_size(size)
}
