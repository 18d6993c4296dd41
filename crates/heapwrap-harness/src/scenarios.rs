//! Policy self-check scenarios.
//!
//! Each scenario drives a derived layer over [`SystemPrimitive`] and checks
//! one externally visible rule. Lifecycle records produced along the way are
//! returned with the verdicts so the CLI can write them as evidence.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use heapwrap_core::align::{NATURAL_ALIGNMENT, page_size};
use heapwrap_core::{
    AllocError, DerivedOps, ForkCoordinator, ForkPhase, MallocZone, RegistrationError, Reallocated,
    SystemPrimitive, WrapConfig, WrapLogRecord, ZeroSizeRealloc, ZoneAdapter, ZoneRegistry,
};

use crate::structured_log::Outcome;

type Ops = DerivedOps<SystemPrimitive>;
type Check = fn(&'static Ops) -> Result<(), Failure>;

/// Verdict for one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    /// API symbol the scenario exercises.
    pub symbol: &'static str,
    pub outcome: Outcome,
    pub detail: Option<String>,
    /// errno of the allocation error that failed the scenario, if any.
    pub errno: Option<i32>,
    pub duration_ns: u64,
}

/// Why a scenario failed.
#[derive(Debug)]
struct Failure {
    detail: String,
    errno: Option<i32>,
}

impl Failure {
    /// An allocation call returned an error the scenario did not expect.
    fn alloc(call: impl std::fmt::Display, err: AllocError) -> Self {
        Self {
            detail: format!("{call}: {err}"),
            errno: Some(err.errno()),
        }
    }
}

impl From<String> for Failure {
    fn from(detail: String) -> Self {
        Self {
            detail,
            errno: None,
        }
    }
}

/// Everything a self-check run produced.
#[derive(Debug)]
pub struct SelfCheck {
    pub reports: Vec<ScenarioReport>,
    pub lifecycle: Vec<WrapLogRecord>,
}

impl SelfCheck {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome == Outcome::Fail)
            .count()
    }
}

const SCENARIOS: &[(&str, &str, Check)] = &[
    ("realloc_shrink_stays_in_place", "realloc", realloc_shrink_stays_in_place),
    ("realloc_deep_shrink_moves", "realloc", realloc_deep_shrink_moves),
    ("realloc_growth_is_amortized", "realloc", realloc_growth_is_amortized),
    ("realloc_zero_returns_minimal_object", "realloc", realloc_zero_returns_minimal_object),
    ("realloc_null_is_malloc", "realloc", realloc_null_is_malloc),
    ("calloc_rejects_overflow", "calloc", calloc_rejects_overflow),
    ("calloc_zero_fills", "calloc", calloc_zero_fills),
    ("memalign_honors_alignment", "memalign", memalign_honors_alignment),
    ("posix_memalign_reports_einval", "posix_memalign", posix_memalign_reports_einval),
    ("aligned_alloc_rejects_overflow", "aligned_alloc", aligned_alloc_rejects_overflow),
    ("valloc_is_page_aligned", "valloc", valloc_is_page_aligned),
    ("strdup_copies_terminator", "strdup", strdup_copies_terminator),
    ("good_size_reports_capacity", "malloc_good_size", good_size_reports_capacity),
    ("fork_bracket_pairs_lock", "fork_prepare", fork_bracket_pairs_lock),
    ("zone_batch_round_trip", "batch_malloc", zone_batch_round_trip),
    ("zone_registers_once", "zone_register", zone_registers_once),
];

/// Names of every scenario, in run order.
pub fn scenario_names() -> impl Iterator<Item = &'static str> {
    SCENARIOS.iter().map(|(name, _, _)| *name)
}

/// Run every scenario whose name contains `filter` (all when `None`).
#[must_use]
pub fn run_self_check(filter: Option<&str>) -> SelfCheck {
    // Zone adapters need a 'static derived layer; one per run is leaked.
    let ops: &'static Ops = Box::leak(Box::new(DerivedOps::with_config(
        SystemPrimitive::new(),
        WrapConfig::DEFAULT.with_trace(true),
    )));

    let reports = SCENARIOS
        .iter()
        .filter(|(name, _, _)| filter.is_none_or(|f| name.contains(f)))
        .map(|&(name, symbol, check)| {
            let started = Instant::now();
            let verdict = check(ops);
            let duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            let (outcome, detail, errno) = match verdict {
                Ok(()) => (Outcome::Pass, None, None),
                Err(failure) => (Outcome::Fail, Some(failure.detail), failure.errno),
            };
            ScenarioReport {
                name,
                symbol,
                outcome,
                detail,
                errno,
                duration_ns,
            }
        })
        .collect();

    SelfCheck {
        reports,
        lifecycle: ops.log().drain(),
    }
}

fn ensure(cond: bool, detail: impl FnOnce() -> String) -> Result<(), Failure> {
    if cond { Ok(()) } else { Err(detail().into()) }
}

fn alloc(ops: &Ops, size: usize) -> Result<NonNull<u8>, Failure> {
    ops.malloc(size)
        .map_err(|e| Failure::alloc(format_args!("malloc({size})"), e))
}

fn usable(ops: &Ops, ptr: *mut u8) -> usize {
    // SAFETY: scenarios only query live pointers they own.
    unsafe { ops.usable_size(ptr) }
}

fn release(ops: &Ops, ptr: *mut u8) {
    // SAFETY: scenarios release each pointer they own exactly once.
    unsafe { ops.free(ptr) }
}

fn realloc(ops: &Ops, ptr: *mut u8, size: usize) -> Result<Reallocated, Failure> {
    // SAFETY: ptr is null or live and owned by the scenario.
    unsafe { ops.realloc(ptr, size) }
        .map_err(|e| Failure::alloc(format_args!("realloc(_, {size})"), e))
}

fn realloc_shrink_stays_in_place(ops: &'static Ops) -> Result<(), Failure> {
    let p = alloc(ops, 200)?.as_ptr();
    let u = usable(ops, p);
    let target = u / 2 + 1;
    let r = realloc(ops, p, target)?;
    let outcome = ensure(matches!(r, Reallocated::InPlace(q) if q.as_ptr() == p), || {
        format!("shrink {u} -> {target} gave {r:?}")
    });
    release(ops, r.as_ptr());
    outcome
}

fn realloc_deep_shrink_moves(ops: &'static Ops) -> Result<(), Failure> {
    let p = alloc(ops, 1024)?.as_ptr();
    let r = realloc(ops, p, 16)?;
    let moved = matches!(r, Reallocated::Moved(_));
    let u = usable(ops, r.as_ptr());
    release(ops, r.as_ptr());
    ensure(moved && u < 1024, || format!("deep shrink kept {u} bytes ({r:?})"))
}

fn realloc_growth_is_amortized(ops: &'static Ops) -> Result<(), Failure> {
    let p = alloc(ops, 256)?.as_ptr();
    let u = usable(ops, p);
    // SAFETY: p has u usable bytes.
    unsafe { p.write_bytes(0x5A, u) };
    let r = realloc(ops, p, u + 1)?;
    let q = r.as_ptr();
    let grown = usable(ops, q);
    // SAFETY: q has at least u + 1 usable bytes.
    let kept = unsafe { std::slice::from_raw_parts(q, u) }
        .iter()
        .all(|&b| b == 0x5A);
    release(ops, q);
    ensure(grown >= u + u / 4 && kept, || {
        format!("grew {u} -> {grown}, contents kept: {kept}")
    })
}

fn realloc_zero_returns_minimal_object(ops: &'static Ops) -> Result<(), Failure> {
    let p = alloc(ops, 64)?.as_ptr();
    let r = realloc(ops, p, 0)?;
    let result = match r {
        Reallocated::Moved(q) if usable(ops, q.as_ptr()) >= 1 => Ok(()),
        other => Err(format!("realloc(p, 0) gave {other:?}")),
    };
    release(ops, r.as_ptr());
    result?;

    let posix = DerivedOps::with_config(
        SystemPrimitive::new(),
        WrapConfig::DEFAULT.with_zero_size_realloc(ZeroSizeRealloc::ReturnNull),
    );
    let p = posix
        .malloc(64)
        .map_err(|e| Failure::alloc("malloc(64)", e))?
        .as_ptr();
    // SAFETY: p is live.
    let r = unsafe { posix.realloc(p, 0) }.map_err(|e| Failure::alloc("realloc(p, 0)", e))?;
    ensure(
        r == Reallocated::Released && posix.primitive().live() == 0,
        || format!("null convention gave {r:?}"),
    )
}

fn realloc_null_is_malloc(ops: &'static Ops) -> Result<(), Failure> {
    let r = realloc(ops, std::ptr::null_mut(), 48)?;
    let u = usable(ops, r.as_ptr());
    release(ops, r.as_ptr());
    ensure(matches!(r, Reallocated::Moved(_)) && u >= 48, || {
        format!("realloc(null, 48) gave {r:?} with {u} usable")
    })
}

fn calloc_rejects_overflow(ops: &'static Ops) -> Result<(), Failure> {
    let before = ops.primitive().allocations();
    let result = ops.calloc(usize::MAX / 2, 3);
    ensure(
        matches!(result, Err(AllocError::Overflow { .. }))
            && ops.primitive().allocations() == before,
        || format!("calloc overflow gave {result:?}"),
    )
}

fn calloc_zero_fills(ops: &'static Ops) -> Result<(), Failure> {
    // Dirty a block first so a recycled chunk would show through.
    let dirty = alloc(ops, 4096)?.as_ptr();
    // SAFETY: dirty has 4096 usable bytes.
    unsafe { dirty.write_bytes(0xFF, 4096) };
    release(ops, dirty);

    let p = ops
        .calloc(64, 64)
        .map_err(|e| Failure::alloc("calloc(64, 64)", e))?
        .as_ptr();
    // SAFETY: p has 4096 usable bytes.
    let zeroed = unsafe { std::slice::from_raw_parts(p, 4096) }
        .iter()
        .all(|&b| b == 0);
    release(ops, p);
    ensure(zeroed, || "calloc returned dirty memory".to_string())
}

fn memalign_honors_alignment(ops: &'static Ops) -> Result<(), Failure> {
    for shift in 0..=16 {
        let alignment = 1usize << shift;
        for size in [1, 24, alignment, 3 * alignment + 5] {
            let p = ops
                .memalign(alignment, size)
                .map_err(|e| Failure::alloc(format_args!("memalign({alignment}, {size})"), e))?
                .as_ptr();
            let u = usable(ops, p);
            release(ops, p);
            ensure(p.addr() % alignment.max(NATURAL_ALIGNMENT) == 0, || {
                format!("memalign({alignment}, {size}) = {p:p}")
            })?;
            ensure(u >= size, || {
                format!("memalign({alignment}, {size}) usable {u}")
            })?;
        }
    }
    ensure(ops.tracked_aligned_blocks() == 0, || {
        "aligned side table not empty".to_string()
    })
}

fn posix_memalign_reports_einval(ops: &'static Ops) -> Result<(), Failure> {
    let sentinel = NonNull::<u8>::dangling().as_ptr();
    let mut out = sentinel;
    let result = ops.posix_memalign(&mut out, 24, 64);
    ensure(
        matches!(result, Err(AllocError::InvalidAlignment { .. })) && out == sentinel,
        || format!("posix_memalign(24) gave {result:?}, out changed: {}", out != sentinel),
    )?;

    let result = ops.posix_memalign(&mut out, 64, 100);
    ensure(result.is_ok() && out.addr() % 64 == 0, || {
        format!("posix_memalign(64) gave {result:?} at {out:p}")
    })?;
    release(ops, out);
    Ok(())
}

fn aligned_alloc_rejects_overflow(ops: &'static Ops) -> Result<(), Failure> {
    let result = ops.aligned_alloc(4096, usize::MAX - 10);
    ensure(matches!(result, Err(AllocError::Overflow { .. })), || {
        format!("aligned_alloc overflow gave {result:?}")
    })
}

fn valloc_is_page_aligned(ops: &'static Ops) -> Result<(), Failure> {
    let page = page_size();
    let p = ops
        .valloc(100)
        .map_err(|e| Failure::alloc("valloc(100)", e))?
        .as_ptr();
    release(ops, p);
    ensure(p.addr() % page == 0, || format!("valloc gave {p:p} for page {page}"))
}

fn strdup_copies_terminator(ops: &'static Ops) -> Result<(), Failure> {
    let source = c"heapwrap";
    let p = ops
        .strdup(source)
        .map_err(|e| Failure::alloc("strdup", e))?
        .as_ptr();
    // SAFETY: strdup produced a NUL-terminated copy.
    let copy = unsafe { std::ffi::CStr::from_ptr(p.cast()) }.to_owned();
    release(ops, p);
    ensure(copy.as_c_str() == source, || format!("strdup gave {copy:?}"))
}

fn good_size_reports_capacity(ops: &'static Ops) -> Result<(), Failure> {
    let live = ops.primitive().live();
    let good = ops.good_size(100);
    ensure(good >= 100 && ops.primitive().live() == live, || {
        format!("good_size(100) = {good}")
    })
}

fn fork_bracket_pairs_lock(ops: &'static Ops) -> Result<(), Failure> {
    let fork = ForkCoordinator::new(ops);
    fork.prepare();
    fork.parent_resume();
    fork.prepare();
    fork.child_resume();
    fork.parent_resume();
    // The primitive must be usable again after both brackets.
    let p = alloc(ops, 32)?;
    release(ops, p.as_ptr());
    ensure(
        fork.phase() == ForkPhase::Idle
            && fork.prepares() == 2
            && fork.parent_resumes() == 1
            && fork.child_resumes() == 1
            && fork.unmatched_resumes() == 1,
        || {
            format!(
                "phase {:?}, prepares {}, parent {}, child {}, unmatched {}",
                fork.phase(),
                fork.prepares(),
                fork.parent_resumes(),
                fork.child_resumes(),
                fork.unmatched_resumes()
            )
        },
    )
}

fn zone_batch_round_trip(ops: &'static Ops) -> Result<(), Failure> {
    let zone = ZoneAdapter::new(ops);
    let live = ops.primitive().live();
    let mut blocks = [std::ptr::null_mut::<u8>(); 16];
    let filled = zone.batch_malloc(40, &mut blocks);
    let all_live = blocks.iter().all(|p| !p.is_null() && usable(ops, *p) >= 40);
    // SAFETY: every filled entry is a live block from this layer.
    unsafe { zone.batch_free(&blocks[..filled]) };
    ensure(
        filled == 16 && all_live && ops.primitive().live() == live,
        || format!("batch_malloc filled {filled}, all live: {all_live}"),
    )
}

/// In-process registry standing in for the platform's zone list.
struct ScratchRegistry {
    default: AtomicPtr<MallocZone>,
    registrations: AtomicUsize,
}

impl ZoneRegistry for ScratchRegistry {
    fn default_zone(&self) -> *mut MallocZone {
        self.default.load(Ordering::Acquire)
    }

    unsafe fn unregister(&self, zone: *mut MallocZone) {
        let _ = self.default.compare_exchange(
            zone,
            std::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    unsafe fn register(&self, zone: *mut MallocZone) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        self.default.store(zone, Ordering::Release);
    }
}

fn zone_registers_once(ops: &'static Ops) -> Result<(), Failure> {
    let zone: &'static ZoneAdapter<SystemPrimitive> = Box::leak(Box::new(ZoneAdapter::new(ops)));
    let registry = ScratchRegistry {
        default: AtomicPtr::new(std::ptr::null_mut()),
        registrations: AtomicUsize::new(0),
    };
    let first = zone.install_as_default(&registry);
    let second = zone.install_as_default(&registry);
    ensure(
        first.is_ok()
            && second == Err(RegistrationError::AlreadyRegistered)
            && registry.registrations.load(Ordering::Relaxed) == 1
            && registry.default_zone() == zone.zone_ptr(),
        || format!("install gave {first:?} then {second:?}"),
    )
}
