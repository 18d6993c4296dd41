//! # heapwrap-core
//!
//! Allocation policy core for replacing a platform's malloc family with a
//! custom allocator that only exposes five primitives: allocate, deallocate,
//! usable-size, lock and unlock.
//!
//! # Architecture
//!
//! ```text
//! caller -> (interposed symbol) -> DerivedOps -> PrimitiveAllocator
//!                                  ^
//!           ZoneAdapter (pluggable-allocator descriptor) -+
//!           ForkCoordinator (lock/unlock around fork) ----> PrimitiveAllocator
//! ```
//!
//! Nothing in this crate performs I/O. Failures are returned as [`AllocError`]
//! values; the ABI crate turns them into null pointers and errno codes.

pub mod align;
pub mod config;
pub mod error;
pub mod fork;
pub mod log;
pub mod ops;
pub mod origins;
pub mod primitive;
pub mod symbols;
pub mod system;
pub mod zone;

pub use config::{WrapConfig, ZeroSizeRealloc, wrap_config};
pub use error::{AllocError, PrefixError, RegistrationError};
pub use fork::{ForkCoordinator, ForkPhase};
pub use log::{LifecycleLog, LogLevel, WrapLogRecord};
pub use ops::{DerivedOps, ReallocFailure, Reallocated};
pub use primitive::PrimitiveAllocator;
pub use system::SystemPrimitive;
pub use zone::{MallocZone, ZONE_NAME, ZONE_VERSION, ZoneAdapter, ZoneRegistry};
