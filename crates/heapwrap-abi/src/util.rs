use std::ffi::{c_int, c_void};
use std::ptr::NonNull;

use heapwrap_core::{AllocError, Reallocated};

#[inline]
pub(crate) fn set_errno(code: c_int) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(target_vendor = "apple")]
    // SAFETY: __error returns this thread's errno slot.
    unsafe {
        *libc::__error() = code;
    }
}

/// A successful derived-layer result as the pointer C receives.
pub(crate) trait RawBlock {
    fn into_block_ptr(self) -> *mut u8;
}

impl RawBlock for NonNull<u8> {
    fn into_block_ptr(self) -> *mut u8 {
        self.as_ptr()
    }
}

impl RawBlock for Reallocated {
    fn into_block_ptr(self) -> *mut u8 {
        self.as_ptr()
    }
}

/// C convention for an allocation result: the pointer, or null with errno set.
#[inline]
pub(crate) fn into_raw<B: RawBlock>(result: Result<B, AllocError>) -> *mut c_void {
    match result {
        Ok(block) => block.into_block_ptr().cast(),
        Err(err) => {
            set_errno(err.errno());
            std::ptr::null_mut()
        }
    }
}
