// Entry points take raw pointers from C callers under the usual malloc-family
// contracts; per-function safety docs would restate them.
#![allow(clippy::missing_safety_doc)]
//! # heapwrap-abi
//!
//! C allocation surface over an externally supplied five-primitive allocator.
//!
//! Build as a `cdylib` and link or preload it next to the primitive
//! (`xxmalloc`, `xxfree`, `xxmalloc_usable_size`, `xxmalloc_lock`,
//! `xxmalloc_unlock` with the default prefix).
//!
//! ```text
//! C caller -> malloc_abi / zone_abi -> DerivedOps (heapwrap-core) -> primitive
//!           fork hooks -> ForkCoordinator -----------------------> primitive
//! ```
//!
//! On ELF targets release builds export the original symbol names. On
//! Darwin the entry points keep Rust names and a `__DATA,__interpose`
//! table redirects the originals; the default zone is replaced at load.

/// Values fixed by the build script.
pub mod build_config {
    include!(concat!(env!("OUT_DIR"), "/build_config.rs"));
}

pub mod surface;
mod util;

// Gated behind cfg(not(test)): these modules bind the external primitive
// symbols and export malloc-family names that would otherwise take over the
// test binary's own allocator.
#[cfg(not(test))]
mod primitive;

#[cfg(not(test))]
pub mod fork_abi;
#[cfg(not(test))]
pub mod malloc_abi;

#[cfg(all(not(test), target_vendor = "apple"))]
mod interpose;
#[cfg(all(not(test), target_vendor = "apple"))]
pub mod zone_abi;
