//! The five-operation primitive allocator contract.
//!
//! Everything in the derived layer is expressed through this trait. The
//! primitive owns its arena layout, free lists and thread safety; this crate
//! never looks inside it.

/// A minimal allocator: allocate, deallocate, usable-size, lock, unlock.
///
/// # Safety
///
/// Implementors guarantee that:
/// - a non-null pointer returned by [`allocate`](Self::allocate) is valid for
///   reads and writes of at least [`usable_size`](Self::usable_size) bytes and
///   is aligned to at least [`crate::align::NATURAL_ALIGNMENT`];
/// - `usable_size(p)` is never smaller than the size most recently requested
///   for `p`;
/// - all methods may be called concurrently from any thread;
/// - after [`lock`](Self::lock) returns, no other thread is mutating allocator
///   state until [`unlock`](Self::unlock) is called.
///
/// The derived layer relies on these guarantees when it copies and zero-fills
/// memory.
pub unsafe trait PrimitiveAllocator: Sync {
    /// Allocate at least `size` bytes. Returns null on failure.
    fn allocate(&self, size: usize) -> *mut u8;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and currently live in this allocator. It is an
    /// interior address only if [`accepts_interior_pointers`](Self::accepts_interior_pointers)
    /// returns true.
    unsafe fn deallocate(&self, ptr: *mut u8);

    /// Capacity reserved behind `ptr`, measured from `ptr`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`deallocate`](Self::deallocate).
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;

    /// Lock every heap so no thread is inside a critical section.
    fn lock(&self);

    /// Undo a previous [`lock`](Self::lock).
    fn unlock(&self);

    /// Whether `deallocate`/`usable_size` accept an address strictly inside a
    /// live block (header-based allocators usually cannot).
    fn accepts_interior_pointers(&self) -> bool {
        true
    }
}

unsafe impl<P: PrimitiveAllocator + ?Sized> PrimitiveAllocator for &P {
    fn allocate(&self, size: usize) -> *mut u8 {
        (**self).allocate(size)
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr) }
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        // SAFETY: forwarded contract.
        unsafe { (**self).usable_size(ptr) }
    }

    fn lock(&self) {
        (**self).lock();
    }

    fn unlock(&self) {
        (**self).unlock();
    }

    fn accepts_interior_pointers(&self) -> bool {
        (**self).accepts_interior_pointers()
    }
}
