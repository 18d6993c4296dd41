//! Darwin default-zone replacement.
//!
//! The adapter is installed as the default zone once, at image load, when
//! the `zone-registration` feature is on. The zone lookup functions below
//! replace their libSystem counterparts through the interpose table, so every
//! zone query in the process answers with this zone.

use std::ffi::{c_char, c_uint, c_void};

use heapwrap_core::{MallocZone, ZoneAdapter, ZoneRegistry};

use crate::primitive::{ExternPrimitive, OPS};

pub(crate) static ZONE: ZoneAdapter<ExternPrimitive> = ZoneAdapter::new(&OPS);

// Calls from this image are not interposed, so these reach libSystem.
unsafe extern "C" {
    #[link_name = "malloc_default_zone"]
    fn system_default_zone() -> *mut MallocZone;
    #[link_name = "malloc_zone_register"]
    fn system_zone_register(zone: *mut MallocZone);
    #[link_name = "malloc_zone_unregister"]
    fn system_zone_unregister(zone: *mut MallocZone);
}

/// libSystem's zone registry.
struct DarwinRegistry;

impl ZoneRegistry for DarwinRegistry {
    fn default_zone(&self) -> *mut MallocZone {
        // SAFETY: no preconditions.
        unsafe { system_default_zone() }
    }

    unsafe fn unregister(&self, zone: *mut MallocZone) {
        // SAFETY: forwarded contract.
        unsafe { system_zone_unregister(zone) }
    }

    unsafe fn register(&self, zone: *mut MallocZone) {
        // SAFETY: forwarded contract.
        unsafe { system_zone_register(zone) }
    }
}

#[cfg(feature = "zone-registration")]
extern "C" fn install_default_zone() {
    // A repeat is recorded by the adapter and otherwise ignored.
    let _ = ZONE.install_as_default(&DarwinRegistry);
}

#[cfg(feature = "zone-registration")]
#[used]
#[unsafe(link_section = "__DATA,__mod_init_func")]
static INSTALL_DEFAULT_ZONE: extern "C" fn() = install_default_zone;

pub unsafe extern "C" fn malloc_default_zone() -> *mut MallocZone {
    ZONE.zone_ptr()
}

pub unsafe extern "C" fn malloc_zone_from_ptr(ptr: *const c_void) -> *mut MallocZone {
    ZONE.zone_from_ptr(ptr)
}

/// Extra zones are not supported; callers fall back to the default zone.
pub unsafe extern "C" fn malloc_create_zone(
    _start_size: usize,
    _flags: c_uint,
) -> *mut MallocZone {
    std::ptr::null_mut()
}

pub unsafe extern "C" fn malloc_destroy_zone(_zone: *mut MallocZone) {}

pub unsafe extern "C" fn malloc_get_zone_name(_zone: *mut MallocZone) -> *const c_char {
    ZONE.name().as_ptr()
}

pub unsafe extern "C" fn malloc_set_zone_name(_zone: *mut MallocZone, _name: *const c_char) {}
