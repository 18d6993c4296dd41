mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use common::{ArenaPrimitive, leaked_ops};
use heapwrap_core::{MallocZone, RegistrationError, ZONE_VERSION, ZoneAdapter, ZoneRegistry};

fn leaked_adapter(primitive: ArenaPrimitive) -> &'static ZoneAdapter<ArenaPrimitive> {
    Box::leak(Box::new(ZoneAdapter::new(leaked_ops(primitive))))
}

#[test]
fn batch_malloc_stops_at_first_failure() {
    let adapter = leaked_adapter(ArenaPrimitive::new().fail_on_allocate(5));
    let zone = adapter.zone_ptr();
    let mut results = [std::ptr::null_mut::<c_void>(); 10];
    // SAFETY: our zone, results has room for 10 pointers.
    let count = unsafe {
        ((*zone).batch_malloc.unwrap())(zone, 64, results.as_mut_ptr(), 10)
    };
    assert_eq!(count, 4);

    let primitive = adapter.ops().primitive();
    assert_eq!(primitive.live_blocks(), 4);
    let mut spans: Vec<_> = results[..4]
        .iter()
        .map(|p| {
            let (start, cap) = primitive.block_containing(p.addr()).unwrap();
            assert_eq!(start, p.addr());
            assert!(cap >= 64);
            (start, start + cap)
        })
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "blocks overlap: {pair:?}");
    }
    // No further allocation was attempted after the failure.
    assert_eq!(primitive.allocate_calls(), 5);
    assert!(results[4].is_null());

    // SAFETY: the first four entries are live blocks from this zone.
    unsafe { ((*zone).batch_free.unwrap())(zone, results.as_mut_ptr(), 4) };
    assert_eq!(primitive.live_blocks(), 0);
}

#[test]
fn batch_malloc_full_success_returns_requested_count() {
    let adapter = leaked_adapter(ArenaPrimitive::new());
    let mut results = [std::ptr::null_mut::<u8>(); 16];
    assert_eq!(adapter.batch_malloc(24, &mut results), 16);
    assert!(results.iter().all(|p| !p.is_null()));
    unsafe { adapter.batch_free(&results) };
    let primitive = adapter.ops().primitive();
    assert_eq!(primitive.deallocate_calls(), 16);
    assert_eq!(primitive.live_blocks(), 0);
}

#[test]
fn batch_entry_points_tolerate_empty_requests() {
    let adapter = leaked_adapter(ArenaPrimitive::new());
    let zone = adapter.zone_ptr();
    // SAFETY: our zone; zero-length requests never touch the lists.
    unsafe {
        let z = &*zone;
        assert_eq!((z.batch_malloc.unwrap())(zone, 64, std::ptr::null_mut(), 3), 0);
        (z.batch_free.unwrap())(zone, std::ptr::null_mut(), 3);
    }
    assert_eq!(adapter.ops().primitive().allocate_calls(), 0);
}

#[test]
fn zone_free_accepts_aligned_interior_blocks() {
    let adapter = leaked_adapter(
        ArenaPrimitive::new()
            .placement(common::Placement::Skewed)
            .interior_pointers(false),
    );
    let zone = adapter.zone_ptr();
    // SAFETY: our zone and our pointers.
    unsafe {
        let z = &*zone;
        assert_eq!(z.version, ZONE_VERSION);
        let p = (z.memalign.unwrap())(zone, 64, 10);
        assert_eq!(p.addr() % 64, 0);
        assert_eq!(adapter.ops().tracked_aligned_blocks(), 1);
        assert!((z.size.unwrap())(zone, p) >= 10);
        (z.free.unwrap())(zone, p);
    }
    assert_eq!(adapter.ops().primitive().live_blocks(), 0);
}

#[test]
fn zone_realloc_to_zero_returns_minimal_object() {
    let adapter = leaked_adapter(ArenaPrimitive::new());
    let zone = adapter.zone_ptr();
    // SAFETY: our zone and our pointers.
    unsafe {
        let z = &*zone;
        let p = (z.valloc.unwrap())(zone, 10);
        let q = (z.realloc.unwrap())(zone, p, 0);
        assert!(!q.is_null());
        assert_ne!(q, p);
        (z.free.unwrap())(zone, q);
    }
    assert_eq!(adapter.ops().primitive().live_blocks(), 0);
}

struct SingleZoneRegistry {
    current: AtomicPtr<MallocZone>,
    registrations: AtomicUsize,
}

impl ZoneRegistry for SingleZoneRegistry {
    fn default_zone(&self) -> *mut MallocZone {
        self.current.load(Ordering::SeqCst)
    }

    unsafe fn unregister(&self, zone: *mut MallocZone) {
        assert_eq!(self.current.swap(std::ptr::null_mut(), Ordering::SeqCst), zone);
    }

    unsafe fn register(&self, zone: *mut MallocZone) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.current.store(zone, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_installs_register_exactly_once() {
    let adapter = leaked_adapter(ArenaPrimitive::new());
    let previous = leaked_adapter(ArenaPrimitive::new());
    let registry = SingleZoneRegistry {
        current: AtomicPtr::new(previous.zone_ptr()),
        registrations: AtomicUsize::new(0),
    };

    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| adapter.install_as_default(&registry)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .filter(|r| r.is_err())
            .all(|r| *r == Err(RegistrationError::AlreadyRegistered))
    );
    assert_eq!(registry.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(registry.default_zone(), adapter.zone_ptr());
}
