//! Alignment arithmetic shared by the aligned-allocation entry points.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocError;

/// Alignment every primitive allocation already satisfies (malloc's
/// `max_align_t` guarantee on LP64 targets).
pub const NATURAL_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

/// Fallback page size when the platform query fails.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Normalize an alignment request for `memalign`.
///
/// Raises the value to [`NATURAL_ALIGNMENT`] and rounds it up to the next
/// power of two. Alignments that cannot be represented fail with
/// [`AllocError::InvalidAlignment`].
pub fn normalize_alignment(alignment: usize) -> Result<usize, AllocError> {
    alignment
        .max(NATURAL_ALIGNMENT)
        .checked_next_power_of_two()
        .ok_or(AllocError::InvalidAlignment { alignment })
}

/// Strict validation used by `posix_memalign` and `aligned_alloc`.
pub fn validate_alignment(alignment: usize) -> Result<usize, AllocError> {
    if alignment.is_power_of_two() {
        Ok(alignment)
    } else {
        Err(AllocError::InvalidAlignment { alignment })
    }
}

#[inline]
#[must_use]
pub fn is_aligned(addr: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    addr & (alignment - 1) == 0
}

/// Round `addr` up to the next multiple of the power-of-two `alignment`.
#[inline]
#[must_use]
pub fn align_up(addr: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (addr + alignment - 1) & !(alignment - 1)
}

/// Size to request on the second memalign attempt: a multiple of
/// `alignment`, and never less than `alignment`.
pub fn padded_size(size: usize, alignment: usize) -> Result<usize, AllocError> {
    if size <= alignment {
        return Ok(alignment);
    }
    size.checked_next_multiple_of(alignment)
        .ok_or(AllocError::Overflow {
            lhs: size,
            rhs: alignment,
        })
}

/// Size of the over-allocated block used by the last memalign strategy.
pub fn over_allocation(size: usize, alignment: usize) -> Result<usize, AllocError> {
    alignment
        .checked_mul(2)
        .and_then(|twice| twice.checked_add(size))
        .ok_or(AllocError::Overflow {
            lhs: alignment,
            rhs: size,
        })
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The platform page size, queried once.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = usize::try_from(raw)
        .ok()
        .filter(|s| s.is_power_of_two())
        .unwrap_or(DEFAULT_PAGE_SIZE);
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}
