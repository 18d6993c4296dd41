//! Reference primitive backed by the process system allocator.
//!
//! Each block carries a one-word header holding its capacity, so interior
//! pointers cannot be resolved; the derived layer falls back to its side
//! table for over-allocated aligned blocks. A raw `parking_lot` mutex guards
//! every mutation so that [`PrimitiveAllocator::lock`] really quiesces the
//! allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

use crate::align::NATURAL_ALIGNMENT;
use crate::primitive::PrimitiveAllocator;

const HEADER: usize = NATURAL_ALIGNMENT;

/// Header-based primitive over [`std::alloc::System`].
pub struct SystemPrimitive {
    mutex: RawMutex,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
}

impl SystemPrimitive {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mutex: RawMutex::INIT,
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
        }
    }

    /// Number of successful `allocate` calls.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of `deallocate` calls.
    #[must_use]
    pub fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::Relaxed)
    }

    /// Blocks allocated and not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.allocations().saturating_sub(self.deallocations())
    }

    fn layout_for(capacity: usize) -> Option<Layout> {
        let total = capacity.checked_add(HEADER)?;
        Layout::from_size_align(total, NATURAL_ALIGNMENT).ok()
    }

    /// # Safety
    ///
    /// `user` must be a live pointer returned by `allocate`.
    unsafe fn base_of(user: *mut u8) -> *mut u8 {
        // SAFETY: every user pointer sits HEADER bytes past its block start.
        unsafe { user.sub(HEADER) }
    }
}

impl Default for SystemPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl PrimitiveAllocator for SystemPrimitive {
    fn allocate(&self, size: usize) -> *mut u8 {
        let Some(capacity) = size.max(1).checked_next_multiple_of(NATURAL_ALIGNMENT) else {
            return std::ptr::null_mut();
        };
        let Some(layout) = Self::layout_for(capacity) else {
            return std::ptr::null_mut();
        };
        self.mutex.lock();
        // SAFETY: layout has non-zero size.
        let base = unsafe { System.alloc(layout) };
        // SAFETY: paired with the lock above.
        unsafe { self.mutex.unlock() };
        if base.is_null() {
            return base;
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        // SAFETY: base is valid for HEADER + capacity bytes and word-aligned.
        unsafe {
            base.cast::<usize>().write(capacity);
            base.add(HEADER)
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: caller passes a live block start.
        let base = unsafe { Self::base_of(ptr) };
        // SAFETY: the header was written by allocate.
        let capacity = unsafe { base.cast::<usize>().read() };
        let Some(layout) = Self::layout_for(capacity) else {
            return;
        };
        self.mutex.lock();
        // SAFETY: same layout that allocate used for this block.
        unsafe { System.dealloc(base, layout) };
        // SAFETY: paired with the lock above.
        unsafe { self.mutex.unlock() };
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        // SAFETY: caller passes a live block start; header is initialized.
        unsafe { Self::base_of(ptr).cast::<usize>().read() }
    }

    fn lock(&self) {
        self.mutex.lock();
    }

    fn unlock(&self) {
        // SAFETY: the fork protocol only unlocks after a matching lock().
        unsafe { self.mutex.unlock() };
    }

    fn accepts_interior_pointers(&self) -> bool {
        false
    }
}
