//! Derived operations: the malloc family expressed through five primitives.
//!
//! [`DerivedOps`] owns no heap of its own. It forwards to a
//! [`PrimitiveAllocator`] and adds the reallocation and alignment policies on
//! top:
//!
//! - `realloc` keeps the block when shrinking by less than half and grows by at
//!   least a quarter of the current capacity, so a block grown one byte at a
//!   time is copied a logarithmic number of times.
//! - `memalign` tries an exact allocation, then a padded one, then an
//!   over-allocation with an interior aligned address.
//! - `calloc` rejects `count * size` overflow before touching the primitive.

use std::ffi::CStr;
use std::ptr::NonNull;

use crate::align::{
    align_up, is_aligned, normalize_alignment, over_allocation, padded_size, page_size,
    validate_alignment,
};
use crate::config::{WrapConfig, ZeroSizeRealloc, wrap_config};
use crate::error::AllocError;
use crate::log::{LifecycleLog, LogEvent, LogLevel};
use crate::origins::AlignedOrigins;
use crate::primitive::PrimitiveAllocator;

/// Result of a successful reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reallocated {
    /// The original block already fits; contents untouched.
    InPlace(NonNull<u8>),
    /// Contents were copied into a new block and the old one released.
    Moved(NonNull<u8>),
    /// `realloc(ptr, 0)` under the null-returning convention: the block was
    /// released and there is no replacement.
    Released,
}

impl Reallocated {
    /// The pointer to hand back to a C caller.
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        match self {
            Self::InPlace(p) | Self::Moved(p) => p.as_ptr(),
            Self::Released => std::ptr::null_mut(),
        }
    }
}

/// What happens to the original block when a reallocation cannot allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocFailure {
    /// `realloc`: the caller still owns the original block.
    PreserveOriginal,
    /// `reallocf`: the original block is released as well.
    FreeOriginal,
}

/// The derived allocation layer over a primitive allocator.
///
/// Built in const context so a single process-wide instance can live in a
/// `static`:
///
/// ```ignore
/// static OPS: DerivedOps<MyPrimitive> = DerivedOps::new(MyPrimitive);
/// ```
pub struct DerivedOps<P> {
    primitive: P,
    origins: AlignedOrigins,
    log: LifecycleLog,
    /// Fixed configuration, or `None` to follow the process environment.
    config: Option<WrapConfig>,
}

impl<P> DerivedOps<P> {
    /// Derived layer whose configuration comes from the environment.
    #[must_use]
    pub const fn new(primitive: P) -> Self {
        Self {
            primitive,
            origins: AlignedOrigins::new(),
            log: LifecycleLog::new(),
            config: None,
        }
    }

    /// Derived layer with a fixed configuration.
    #[must_use]
    pub const fn with_config(primitive: P, config: WrapConfig) -> Self {
        Self {
            primitive,
            origins: AlignedOrigins::new(),
            log: LifecycleLog::new(),
            config: Some(config),
        }
    }

    #[must_use]
    pub fn primitive(&self) -> &P {
        &self.primitive
    }

    /// Lifecycle records of this layer and of the zone/fork components
    /// built on it.
    #[must_use]
    pub fn log(&self) -> &LifecycleLog {
        &self.log
    }

    #[must_use]
    pub fn config(&self) -> WrapConfig {
        self.config.unwrap_or_else(wrap_config)
    }

    /// Live over-allocated aligned blocks whose start is held out-of-band.
    #[must_use]
    pub fn tracked_aligned_blocks(&self) -> usize {
        self.origins.len()
    }

    /// Lock the side table and the lifecycle ring, in that order, and keep
    /// them locked until [`thaw_side_state`](Self::thaw_side_state).
    pub(crate) fn freeze_side_state(&self) {
        self.origins.freeze();
        self.log.freeze();
    }

    /// # Safety
    ///
    /// Must follow [`freeze_side_state`](Self::freeze_side_state), once.
    pub(crate) unsafe fn thaw_side_state(&self) {
        // SAFETY: both locks were frozen by the caller's matching freeze.
        unsafe {
            self.log.thaw();
            self.origins.thaw();
        }
    }

    #[cfg(test)]
    pub(crate) fn origins(&self) -> &AlignedOrigins {
        &self.origins
    }

    fn trace(&self, event: LogEvent) {
        if self.config().trace {
            self.log.record(event);
        }
    }
}

impl<P: PrimitiveAllocator> DerivedOps<P> {
    /// Allocate `size` bytes from the primitive.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        NonNull::new(self.primitive.allocate(size))
            .ok_or(AllocError::OutOfMemory { requested: size })
    }

    /// Map a pointer handed out by this layer to its primitive block and the
    /// offset of `ptr` inside that block.
    fn block_of(&self, ptr: *mut u8) -> (*mut u8, usize) {
        match self.origins.origin_of(ptr.addr()) {
            Some(origin) => {
                let offset = ptr.addr() - origin;
                (ptr.wrapping_sub(offset), offset)
            }
            None => (ptr, 0),
        }
    }

    /// Release a block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this layer.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = match self.origins.take(ptr.addr()) {
            Some(origin) => ptr.wrapping_sub(ptr.addr() - origin),
            None => ptr,
        };
        // SAFETY: block is the primitive block start, or ptr itself when the
        // primitive tolerates interior addresses.
        unsafe { self.primitive.deallocate(block) };
    }

    /// Same as [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// See [`free`](Self::free).
    pub unsafe fn vfree(&self, ptr: *mut u8) {
        // SAFETY: forwarded contract.
        unsafe { self.free(ptr) }
    }

    /// Bytes usable from `ptr` onward. Null reports 0.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this layer.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let (block, offset) = self.block_of(ptr);
        // SAFETY: block is live per the caller contract.
        let capacity = unsafe { self.primitive.usable_size(block) };
        capacity.saturating_sub(offset)
    }

    /// Capacity the primitive would actually reserve for `size`.
    ///
    /// Probes with a real allocation; reports `size` if the probe fails.
    pub fn good_size(&self, size: usize) -> usize {
        let Ok(probe) = self.malloc(size) else {
            return size;
        };
        // SAFETY: probe is live and released exactly once.
        unsafe {
            let usable = self.primitive.usable_size(probe.as_ptr());
            self.primitive.deallocate(probe.as_ptr());
            usable
        }
    }

    /// `realloc`: on failure the original block stays live.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this layer. Unless the
    /// result is [`Reallocated::InPlace`] or an error, `ptr` is dangling after
    /// the call.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Result<Reallocated, AllocError> {
        // SAFETY: forwarded contract.
        unsafe { self.realloc_with(ptr, size, ReallocFailure::PreserveOriginal) }
    }

    /// `reallocf`: on failure the original block is released too.
    ///
    /// # Safety
    ///
    /// As [`realloc`](Self::realloc), except `ptr` is also dangling after an
    /// error.
    pub unsafe fn reallocf(&self, ptr: *mut u8, size: usize) -> Result<Reallocated, AllocError> {
        // SAFETY: forwarded contract.
        unsafe { self.realloc_with(ptr, size, ReallocFailure::FreeOriginal) }
    }

    /// Reallocate with an explicit failure convention.
    ///
    /// # Safety
    ///
    /// See [`realloc`](Self::realloc) and [`reallocf`](Self::reallocf).
    pub unsafe fn realloc_with(
        &self,
        ptr: *mut u8,
        size: usize,
        on_failure: ReallocFailure,
    ) -> Result<Reallocated, AllocError> {
        let Some(current) = NonNull::new(ptr) else {
            return self.malloc(size).map(Reallocated::Moved);
        };

        if size == 0 {
            // SAFETY: ptr is live per the caller contract.
            unsafe { self.free(ptr) };
            let convention = self.config().zero_size_realloc;
            self.trace(
                LogEvent::new(LogLevel::Trace, "realloc", "realloc_zero_size", "released")
                    .ptr(ptr.addr()),
            );
            return match convention {
                ZeroSizeRealloc::MinimalObject => self.malloc(1).map(Reallocated::Moved),
                ZeroSizeRealloc::ReturnNull => Ok(Reallocated::Released),
            };
        }

        // SAFETY: ptr is live per the caller contract.
        let old = unsafe { self.usable_size(ptr) };
        if old / 2 < size && size <= old {
            self.trace(
                LogEvent::new(LogLevel::Trace, "realloc", "realloc_in_place", "success")
                    .ptr(ptr.addr())
                    .size(size),
            );
            return Ok(Reallocated::InPlace(current));
        }

        let target = if size > old {
            size.max(old.saturating_add(old / 4))
        } else {
            size
        };
        let fresh = match self.malloc(target) {
            Ok(fresh) => fresh,
            Err(err) => {
                if on_failure == ReallocFailure::FreeOriginal {
                    // SAFETY: ptr is live; reallocf consumes it on failure.
                    unsafe { self.free(ptr) };
                }
                self.trace(
                    LogEvent::new(LogLevel::Warn, "realloc", "realloc_failed", err.outcome())
                        .ptr(ptr.addr())
                        .size(target),
                );
                return Err(err);
            }
        };

        // SAFETY: both regions are live and distinct; ptr has at least `old`
        // usable bytes and fresh at least `target >= min(old, size)`.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old.min(size));
            self.free(ptr);
        }
        self.trace(
            LogEvent::new(LogLevel::Trace, "realloc", "realloc_moved", "success")
                .ptr(fresh.as_ptr().addr())
                .size(target),
        );
        Ok(Reallocated::Moved(fresh))
    }

    /// Zero-filled allocation of `count * size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(total) = count.checked_mul(size) else {
            let err = AllocError::Overflow {
                lhs: count,
                rhs: size,
            };
            self.trace(LogEvent::new(
                LogLevel::Warn,
                "calloc",
                "calloc_overflow",
                err.outcome(),
            ));
            return Err(err);
        };
        let block = self.malloc(total)?;
        // SAFETY: block is valid for at least `total` bytes.
        unsafe { block.as_ptr().write_bytes(0, total) };
        Ok(block)
    }

    /// Copy a C string, terminator included, into a fresh block.
    pub fn strdup(&self, s: &CStr) -> Result<NonNull<u8>, AllocError> {
        let bytes = s.to_bytes_with_nul();
        let block = self.malloc(bytes.len())?;
        // SAFETY: block holds at least bytes.len() bytes and is a new allocation.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.as_ptr(), bytes.len()) };
        Ok(block)
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// The alignment is raised to the natural alignment and rounded up to a
    /// power of two. Three attempts, each released before the next: exact
    /// size, size padded to a multiple of the alignment, and finally an
    /// over-allocation of `2 * alignment + padded` with an aligned address
    /// inside it.
    pub fn memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let alignment = normalize_alignment(alignment)?;

        let exact = self.malloc(size)?;
        if is_aligned(exact.as_ptr().addr(), alignment) {
            return Ok(exact);
        }
        // SAFETY: exact came straight from the primitive.
        unsafe { self.primitive.deallocate(exact.as_ptr()) };

        let padded = padded_size(size, alignment)?;
        let rounded = self.malloc(padded)?;
        if is_aligned(rounded.as_ptr().addr(), alignment) {
            self.trace(
                LogEvent::new(LogLevel::Trace, "memalign", "memalign_padded", "success")
                    .ptr(rounded.as_ptr().addr())
                    .size(padded)
                    .alignment(alignment),
            );
            return Ok(rounded);
        }
        // SAFETY: rounded came straight from the primitive.
        unsafe { self.primitive.deallocate(rounded.as_ptr()) };

        let total = over_allocation(padded, alignment)?;
        let block = self.malloc(total)?;
        let start = block.as_ptr().addr();
        let offset = align_up(start, alignment) - start;
        if offset == 0 {
            return Ok(block);
        }
        let interior_ok = self.primitive.accepts_interior_pointers();
        if !interior_ok && !self.origins.insert(start + offset, start) {
            // SAFETY: block came straight from the primitive.
            unsafe { self.primitive.deallocate(block.as_ptr()) };
            let err = AllocError::OutOfMemory { requested: total };
            self.trace(
                LogEvent::new(
                    LogLevel::Warn,
                    "memalign",
                    "memalign_origin_table_full",
                    err.outcome(),
                )
                .size(total)
                .alignment(alignment),
            );
            return Err(err);
        }
        // SAFETY: offset < alignment and the block holds 2 * alignment + padded
        // bytes, so the aligned address and `padded` bytes after it are in bounds.
        let aligned = unsafe { block.add(offset) };
        self.trace(
            LogEvent::new(LogLevel::Trace, "memalign", "memalign_over_allocate", "success")
                .ptr(aligned.as_ptr().addr())
                .size(total)
                .alignment(alignment),
        );
        Ok(aligned)
    }

    /// C11 `aligned_alloc`: strict alignment, size rounded up to a multiple of it.
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let alignment = validate_alignment(alignment)?;
        let size = size
            .checked_next_multiple_of(alignment)
            .ok_or(AllocError::Overflow {
                lhs: size,
                rhs: alignment,
            })?;
        self.memalign(alignment, size)
    }

    /// `posix_memalign`: `out` is written only on success.
    pub fn posix_memalign(
        &self,
        out: &mut *mut u8,
        alignment: usize,
        size: usize,
    ) -> Result<(), AllocError> {
        let result = validate_alignment(alignment).and_then(|a| self.memalign(a, size));
        match result {
            Ok(block) => {
                *out = block.as_ptr();
                Ok(())
            }
            Err(err) => {
                self.trace(
                    LogEvent::new(
                        LogLevel::Warn,
                        "posix_memalign",
                        "posix_memalign_failed",
                        err.outcome(),
                    )
                    .size(size)
                    .alignment(alignment),
                );
                Err(err)
            }
        }
    }

    /// Page-aligned allocation.
    pub fn valloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.memalign(page_size(), size)
    }
}
