//! Pluggable-allocator descriptor (Darwin `malloc_zone_t`).
//!
//! Generic allocator-discovery code on Darwin walks registered zones and
//! calls through their function tables. [`ZoneAdapter`] is one such zone
//! whose slots all route into a [`DerivedOps`]. The record layout is the
//! platform's version 8: everything up to and including `pressure_relief`.
//!
//! The adapter is `#[repr(C)]` with the zone record first, so the zone
//! pointer handed to the platform is also a pointer to the adapter. The
//! callbacks recover their derived layer from it; nothing is global.
//!
//! The type itself is portable so the table can be exercised anywhere;
//! only the ABI crate registers it, and only on Darwin.

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RegistrationError;
use crate::log::{LogEvent, LogLevel};
use crate::ops::{DerivedOps, Reallocated};
use crate::primitive::PrimitiveAllocator;

/// Display name of the zone.
pub const ZONE_NAME: &CStr = c"DefaultMallocZone";

/// Protocol version tag: the record ends at `pressure_relief`.
pub const ZONE_VERSION: c_uint = 8;

/// `kern_return_t` success.
const KERN_SUCCESS: c_int = 0;

/// `malloc_zone_t`, version 8.
#[repr(C)]
pub struct MallocZone {
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,
    pub size: Option<unsafe extern "C" fn(*mut MallocZone, *const c_void) -> usize>,
    pub malloc: Option<unsafe extern "C" fn(*mut MallocZone, usize) -> *mut c_void>,
    pub calloc: Option<unsafe extern "C" fn(*mut MallocZone, usize, usize) -> *mut c_void>,
    pub valloc: Option<unsafe extern "C" fn(*mut MallocZone, usize) -> *mut c_void>,
    pub free: Option<unsafe extern "C" fn(*mut MallocZone, *mut c_void)>,
    pub realloc: Option<unsafe extern "C" fn(*mut MallocZone, *mut c_void, usize) -> *mut c_void>,
    pub destroy: Option<unsafe extern "C" fn(*mut MallocZone)>,
    pub zone_name: *const c_char,
    pub batch_malloc:
        Option<unsafe extern "C" fn(*mut MallocZone, usize, *mut *mut c_void, c_uint) -> c_uint>,
    pub batch_free: Option<unsafe extern "C" fn(*mut MallocZone, *mut *mut c_void, c_uint)>,
    pub introspect: *const MallocIntrospection,
    pub version: c_uint,
    pub memalign: Option<unsafe extern "C" fn(*mut MallocZone, usize, usize) -> *mut c_void>,
    pub free_definite_size: Option<unsafe extern "C" fn(*mut MallocZone, *mut c_void, usize)>,
    pub pressure_relief: Option<unsafe extern "C" fn(*mut MallocZone, usize) -> usize>,
}

/// `malloc_statistics_t`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MallocStatistics {
    pub blocks_in_use: c_uint,
    pub size_in_use: usize,
    pub max_size_in_use: usize,
    pub size_allocated: usize,
}

/// `malloc_introspection_t`, through the version 7 discharge slots.
#[repr(C)]
pub struct MallocIntrospection {
    pub enumerator: Option<
        unsafe extern "C" fn(
            c_uint,
            *mut c_void,
            c_uint,
            usize,
            *const c_void,
            *const c_void,
        ) -> c_int,
    >,
    pub good_size: Option<unsafe extern "C" fn(*mut MallocZone, usize) -> usize>,
    pub check: Option<unsafe extern "C" fn(*mut MallocZone) -> c_int>,
    pub print: Option<unsafe extern "C" fn(*mut MallocZone, c_int)>,
    pub log: Option<unsafe extern "C" fn(*mut MallocZone, *mut c_void)>,
    pub force_lock: Option<unsafe extern "C" fn(*mut MallocZone)>,
    pub force_unlock: Option<unsafe extern "C" fn(*mut MallocZone)>,
    pub statistics: Option<unsafe extern "C" fn(*mut MallocZone, *mut MallocStatistics)>,
    pub zone_locked: Option<unsafe extern "C" fn(*mut MallocZone) -> c_int>,
    pub enable_discharge_checking: Option<unsafe extern "C" fn(*mut MallocZone) -> c_int>,
    pub disable_discharge_checking: Option<unsafe extern "C" fn(*mut MallocZone)>,
    pub discharge: Option<unsafe extern "C" fn(*mut MallocZone, *mut c_void)>,
    pub enumerate_discharged_pointers: *const c_void,
}

/// The platform's zone registry.
///
/// Abstracted so registration can be driven against a recording fake.
pub trait ZoneRegistry {
    /// The zone currently answering `malloc_default_zone()`.
    fn default_zone(&self) -> *mut MallocZone;

    /// # Safety
    ///
    /// `zone` must be a zone the registry knows.
    unsafe fn unregister(&self, zone: *mut MallocZone);

    /// # Safety
    ///
    /// `zone` must stay valid for the rest of the process.
    unsafe fn register(&self, zone: *mut MallocZone);
}

/// A zone whose slots all route into one derived layer.
#[repr(C)]
pub struct ZoneAdapter<P: 'static> {
    zone: UnsafeCell<MallocZone>,
    ops: &'static DerivedOps<P>,
    registered: AtomicBool,
}

// SAFETY: the zone record is written only by the platform through the
// pointer it was handed; the derived layer is Sync because P is.
unsafe impl<P: PrimitiveAllocator + 'static> Sync for ZoneAdapter<P> {}

impl<P: PrimitiveAllocator + 'static> ZoneAdapter<P> {
    const INTROSPECTION: &'static MallocIntrospection = &MallocIntrospection {
        enumerator: Some(introspect_enumerate),
        good_size: Some(introspect_good_size::<P>),
        check: Some(introspect_check),
        print: Some(introspect_print),
        log: Some(introspect_log),
        force_lock: Some(introspect_force_lock),
        force_unlock: Some(introspect_force_unlock),
        statistics: Some(introspect_statistics),
        zone_locked: Some(introspect_zone_locked),
        enable_discharge_checking: None,
        disable_discharge_checking: None,
        discharge: None,
        enumerate_discharged_pointers: std::ptr::null(),
    };

    #[must_use]
    pub const fn new(ops: &'static DerivedOps<P>) -> Self {
        Self {
            zone: UnsafeCell::new(MallocZone {
                reserved1: std::ptr::null_mut(),
                reserved2: std::ptr::null_mut(),
                size: Some(zone_size::<P>),
                malloc: Some(zone_malloc::<P>),
                calloc: Some(zone_calloc::<P>),
                valloc: Some(zone_valloc::<P>),
                free: Some(zone_free::<P>),
                realloc: Some(zone_realloc::<P>),
                destroy: Some(zone_destroy),
                zone_name: ZONE_NAME.as_ptr(),
                batch_malloc: Some(zone_batch_malloc::<P>),
                batch_free: Some(zone_batch_free::<P>),
                introspect: Self::INTROSPECTION,
                version: ZONE_VERSION,
                memalign: Some(zone_memalign::<P>),
                free_definite_size: Some(zone_free_definite_size::<P>),
                pressure_relief: Some(zone_pressure_relief),
            }),
            ops,
            registered: AtomicBool::new(false),
        }
    }

    /// Pointer handed to the platform. Derived from the whole adapter so the
    /// callbacks may read past the zone record.
    #[must_use]
    pub fn zone_ptr(&self) -> *mut MallocZone {
        std::ptr::from_ref(self).cast_mut().cast()
    }

    #[must_use]
    pub fn ops(&self) -> &'static DerivedOps<P> {
        self.ops
    }

    #[must_use]
    pub fn name(&self) -> &'static CStr {
        ZONE_NAME
    }

    /// Every pointer belongs to this zone once it is the default.
    #[must_use]
    pub fn zone_from_ptr(&self, _ptr: *const c_void) -> *mut MallocZone {
        self.zone_ptr()
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Allocate `results.len()` blocks of `size` bytes.
    ///
    /// Stops at the first failure and returns how many were filled; earlier
    /// blocks stay live and owned by the caller.
    pub fn batch_malloc(&self, size: usize, results: &mut [*mut u8]) -> usize {
        for (filled, slot) in results.iter_mut().enumerate() {
            match self.ops.malloc(size) {
                Ok(block) => *slot = block.as_ptr(),
                Err(_) => {
                    *slot = std::ptr::null_mut();
                    return filled;
                }
            }
        }
        results.len()
    }

    /// Release every block in `blocks`.
    ///
    /// # Safety
    ///
    /// Each entry must be null or a live pointer from this zone, listed once.
    pub unsafe fn batch_free(&self, blocks: &[*mut u8]) {
        for &block in blocks {
            // SAFETY: caller contract.
            unsafe { self.ops.free(block) };
        }
    }

    /// Make this zone the process default, replacing the previous one.
    ///
    /// Succeeds once per adapter.
    pub fn install_as_default<R: ZoneRegistry + ?Sized>(
        &self,
        registry: &R,
    ) -> Result<(), RegistrationError> {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.ops.log().record(LogEvent::new(
                LogLevel::Warn,
                "zone_register",
                "zone_register_repeat",
                "already_registered",
            ));
            return Err(RegistrationError::AlreadyRegistered);
        }

        let ours = self.zone_ptr();
        let previous = registry.default_zone();
        if !previous.is_null() && previous != ours {
            // SAFETY: previous came from the registry itself.
            unsafe { registry.unregister(previous) };
        }
        // SAFETY: adapters are registered only from 'static storage.
        unsafe { registry.register(ours) };
        self.ops.log().record(
            LogEvent::new(LogLevel::Info, "zone_register", "zone_registered", "success")
                .ptr(ours.addr()),
        );
        Ok(())
    }
}

/// # Safety
///
/// `zone` must be the `zone_ptr()` of a live `ZoneAdapter<P>`.
unsafe fn ops_of<'z, P: PrimitiveAllocator + 'static>(zone: *mut MallocZone) -> &'z DerivedOps<P> {
    // SAFETY: ZoneAdapter is repr(C) with the zone record at offset 0.
    unsafe { (*zone.cast::<ZoneAdapter<P>>()).ops }
}

unsafe extern "C" fn zone_size<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    ptr: *const c_void,
) -> usize {
    // SAFETY: the platform passes our zone and a pointer it attributes to us.
    unsafe { ops_of::<P>(zone).usable_size(ptr.cast_mut().cast()) }
}

unsafe extern "C" fn zone_malloc<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    size: usize,
) -> *mut c_void {
    // SAFETY: the platform passes our zone.
    let ops = unsafe { ops_of::<P>(zone) };
    ops.malloc(size)
        .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
}

unsafe extern "C" fn zone_calloc<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    count: usize,
    size: usize,
) -> *mut c_void {
    // SAFETY: the platform passes our zone.
    let ops = unsafe { ops_of::<P>(zone) };
    ops.calloc(count, size)
        .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
}

unsafe extern "C" fn zone_valloc<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    size: usize,
) -> *mut c_void {
    // SAFETY: the platform passes our zone.
    let ops = unsafe { ops_of::<P>(zone) };
    ops.valloc(size)
        .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
}

unsafe extern "C" fn zone_free<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    ptr: *mut c_void,
) {
    // SAFETY: the platform passes our zone and one of our pointers.
    unsafe { ops_of::<P>(zone).free(ptr.cast()) }
}

unsafe extern "C" fn zone_realloc<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    // SAFETY: the platform passes our zone and one of our pointers.
    let result = unsafe { ops_of::<P>(zone).realloc(ptr.cast(), size) };
    result.map_or(std::ptr::null_mut(), |r| Reallocated::as_ptr(r).cast())
}

unsafe extern "C" fn zone_destroy(_zone: *mut MallocZone) {}

unsafe extern "C" fn zone_batch_malloc<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: c_uint,
) -> c_uint {
    if results.is_null() || num_requested == 0 {
        return 0;
    }
    // SAFETY: the platform passes our zone.
    let adapter = unsafe { &*zone.cast::<ZoneAdapter<P>>() };
    // SAFETY: results has room for num_requested pointers.
    let slots =
        unsafe { std::slice::from_raw_parts_mut(results.cast::<*mut u8>(), num_requested as usize) };
    // filled <= num_requested, so it fits.
    adapter.batch_malloc(size, slots) as c_uint
}

unsafe extern "C" fn zone_batch_free<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    to_be_freed: *mut *mut c_void,
    num: c_uint,
) {
    if to_be_freed.is_null() || num == 0 {
        return;
    }
    // SAFETY: the platform passes our zone and a list of num of our pointers.
    unsafe {
        let adapter = &*zone.cast::<ZoneAdapter<P>>();
        let blocks = std::slice::from_raw_parts(to_be_freed.cast::<*mut u8>(), num as usize);
        adapter.batch_free(blocks);
    }
}

unsafe extern "C" fn zone_memalign<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    alignment: usize,
    size: usize,
) -> *mut c_void {
    // SAFETY: the platform passes our zone.
    let ops = unsafe { ops_of::<P>(zone) };
    ops.memalign(alignment, size)
        .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
}

unsafe extern "C" fn zone_free_definite_size<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    ptr: *mut c_void,
    _size: usize,
) {
    // SAFETY: the platform passes our zone and one of our pointers.
    unsafe { ops_of::<P>(zone).free(ptr.cast()) }
}

unsafe extern "C" fn zone_pressure_relief(_zone: *mut MallocZone, _goal: usize) -> usize {
    0
}

unsafe extern "C" fn introspect_enumerate(
    _task: c_uint,
    _context: *mut c_void,
    _type_mask: c_uint,
    _zone_address: usize,
    _reader: *const c_void,
    _recorder: *const c_void,
) -> c_int {
    KERN_SUCCESS
}

unsafe extern "C" fn introspect_good_size<P: PrimitiveAllocator + 'static>(
    zone: *mut MallocZone,
    size: usize,
) -> usize {
    // SAFETY: the platform passes our zone.
    unsafe { ops_of::<P>(zone) }.good_size(size)
}

unsafe extern "C" fn introspect_check(_zone: *mut MallocZone) -> c_int {
    1
}

unsafe extern "C" fn introspect_print(_zone: *mut MallocZone, _verbose: c_int) {}

unsafe extern "C" fn introspect_log(_zone: *mut MallocZone, _address: *mut c_void) {}

// Fork locking belongs to the fork coordinator.
unsafe extern "C" fn introspect_force_lock(_zone: *mut MallocZone) {}

unsafe extern "C" fn introspect_force_unlock(_zone: *mut MallocZone) {}

unsafe extern "C" fn introspect_statistics(_zone: *mut MallocZone, stats: *mut MallocStatistics) {
    if !stats.is_null() {
        // SAFETY: the platform passes a writable statistics record.
        unsafe { stats.write(MallocStatistics::default()) };
    }
}

unsafe extern "C" fn introspect_zone_locked(_zone: *mut MallocZone) -> c_int {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WrapConfig;
    use crate::system::SystemPrimitive;
    use std::mem::offset_of;
    use std::sync::Mutex;

    fn leaked_adapter() -> &'static ZoneAdapter<SystemPrimitive> {
        let ops = Box::leak(Box::new(DerivedOps::with_config(
            SystemPrimitive::new(),
            WrapConfig::DEFAULT,
        )));
        Box::leak(Box::new(ZoneAdapter::new(ops)))
    }

    #[derive(Default)]
    struct RecordingRegistry {
        default: usize,
        calls: Mutex<Vec<(&'static str, usize)>>,
    }

    impl ZoneRegistry for RecordingRegistry {
        fn default_zone(&self) -> *mut MallocZone {
            std::ptr::without_provenance_mut(self.default)
        }

        unsafe fn unregister(&self, zone: *mut MallocZone) {
            self.calls.lock().unwrap().push(("unregister", zone.addr()));
        }

        unsafe fn register(&self, zone: *mut MallocZone) {
            self.calls.lock().unwrap().push(("register", zone.addr()));
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn zone_record_matches_version_8_layout() {
        assert_eq!(offset_of!(MallocZone, size), 16);
        assert_eq!(offset_of!(MallocZone, zone_name), 72);
        assert_eq!(offset_of!(MallocZone, introspect), 96);
        assert_eq!(offset_of!(MallocZone, version), 104);
        assert_eq!(offset_of!(MallocZone, memalign), 112);
        assert_eq!(offset_of!(MallocZone, pressure_relief), 128);
        assert_eq!(std::mem::size_of::<MallocZone>(), 136);
        assert_eq!(offset_of!(ZoneAdapter<SystemPrimitive>, zone), 0);
    }

    #[test]
    fn descriptor_identity() {
        let adapter = leaked_adapter();
        // SAFETY: zone_ptr points at the initialized record.
        let zone = unsafe { &*adapter.zone_ptr() };
        assert_eq!(zone.version, 8);
        // SAFETY: zone_name points at a static C string.
        let name = unsafe { CStr::from_ptr(zone.zone_name) };
        assert_eq!(name.to_str().unwrap(), "DefaultMallocZone");
        assert_eq!(adapter.name(), name);
        assert_eq!(adapter.zone_from_ptr(std::ptr::null()), adapter.zone_ptr());
    }

    #[test]
    fn slots_route_into_derived_layer() {
        let adapter = leaked_adapter();
        let zone = adapter.zone_ptr();
        // SAFETY: every slot is filled and called with our own zone.
        unsafe {
            let z = &*zone;
            let p = (z.malloc.unwrap())(zone, 40);
            assert!(!p.is_null());
            assert!((z.size.unwrap())(zone, p) >= 40);
            let q = (z.realloc.unwrap())(zone, p, 400);
            assert!((z.size.unwrap())(zone, q) >= 400);
            (z.free_definite_size.unwrap())(zone, q, 400);

            let c = (z.calloc.unwrap())(zone, 8, 8).cast::<u8>();
            assert!(std::slice::from_raw_parts(c, 64).iter().all(|&b| b == 0));
            (z.free.unwrap())(zone, c.cast());

            let a = (z.memalign.unwrap())(zone, 256, 10);
            assert_eq!(a.addr() % 256, 0);
            (z.free.unwrap())(zone, a);

            (z.destroy.unwrap())(zone);
            assert_eq!((z.pressure_relief.unwrap())(zone, 1 << 20), 0);
        }
        assert_eq!(adapter.ops().primitive().live(), 0);
    }

    #[test]
    fn introspection_is_inert_except_good_size() {
        let adapter = leaked_adapter();
        let zone = adapter.zone_ptr();
        // SAFETY: introspect points at the static table.
        unsafe {
            let table = &*(*zone).introspect;
            assert_eq!((table.good_size.unwrap())(zone, 20), 32);
            assert_eq!((table.check.unwrap())(zone), 1);
            assert_eq!((table.zone_locked.unwrap())(zone), 0);
            (table.force_lock.unwrap())(zone);
            (table.force_unlock.unwrap())(zone);
            (table.print.unwrap())(zone, 1);
            (table.log.unwrap())(zone, std::ptr::null_mut());
            let mut stats = MallocStatistics {
                blocks_in_use: 7,
                ..MallocStatistics::default()
            };
            (table.statistics.unwrap())(zone, &mut stats);
            assert_eq!(stats, MallocStatistics::default());
        }
        // force_lock must not have taken the primitive lock.
        let p = adapter.ops().malloc(8).unwrap();
        unsafe { adapter.ops().free(p.as_ptr()) };
    }

    #[test]
    fn registration_replaces_previous_default_once() {
        let adapter = leaked_adapter();
        let registry = RecordingRegistry {
            default: 0x1000,
            ..RecordingRegistry::default()
        };
        assert!(!adapter.is_registered());
        adapter.install_as_default(&registry).unwrap();
        assert!(adapter.is_registered());
        assert_eq!(
            adapter.install_as_default(&registry),
            Err(RegistrationError::AlreadyRegistered)
        );
        let calls = registry.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("unregister", 0x1000),
                ("register", adapter.zone_ptr().addr())
            ]
        );
        let events: Vec<_> = adapter.ops().log().drain().iter().map(|r| r.event).collect();
        assert_eq!(events, vec!["zone_registered", "zone_register_repeat"]);
    }

    #[test]
    fn registration_without_previous_default_only_registers() {
        let adapter = leaked_adapter();
        let registry = RecordingRegistry::default();
        adapter.install_as_default(&registry).unwrap();
        let calls = registry.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "register");
    }
}
