//! Scriptable primitive allocator shared by the integration tests.
//!
//! A bump arena over one page-aligned region. Live blocks are tracked in a
//! map so that interior addresses can be resolved (or rejected), and every
//! primitive call is counted.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use heapwrap_core::{DerivedOps, PrimitiveAllocator, WrapConfig};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

const ARENA_BYTES: usize = 64 << 20;
const ARENA_ALIGN: usize = 4096;

/// Where the arena places a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// 16-byte aligned, capacity rounded to 16.
    Natural,
    /// Capacity rounded to a power of two; block aligned to its capacity
    /// (capped at one page).
    SizeClass,
    /// Every block starts 16 bytes past a 128-byte boundary, so no block is
    /// ever 32-byte aligned.
    Skewed,
}

struct ArenaState {
    bump: usize,
    /// start address -> capacity
    live: BTreeMap<usize, usize>,
}

pub struct ArenaPrimitive {
    base: *mut u8,
    placement: Placement,
    interior: bool,
    fail_on: Option<usize>,
    poison: Option<u8>,
    gate: RawMutex,
    state: Mutex<ArenaState>,
    allocate_calls: AtomicUsize,
    deallocate_calls: AtomicUsize,
    lock_calls: AtomicUsize,
    unlock_calls: AtomicUsize,
}

// SAFETY: base is only dereferenced through blocks handed out under the
// state mutex.
unsafe impl Send for ArenaPrimitive {}
unsafe impl Sync for ArenaPrimitive {}

impl ArenaPrimitive {
    pub fn new() -> Self {
        let layout = Self::layout();
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena backing allocation failed");
        Self {
            base,
            placement: Placement::Natural,
            interior: true,
            fail_on: None,
            poison: None,
            gate: RawMutex::INIT,
            state: Mutex::new(ArenaState {
                bump: 0,
                live: BTreeMap::new(),
            }),
            allocate_calls: AtomicUsize::new(0),
            deallocate_calls: AtomicUsize::new(0),
            lock_calls: AtomicUsize::new(0),
            unlock_calls: AtomicUsize::new(0),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(ARENA_BYTES, ARENA_ALIGN).unwrap()
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Whether `deallocate`/`usable_size` accept addresses inside a block.
    pub fn interior_pointers(mut self, accept: bool) -> Self {
        self.interior = accept;
        self
    }

    /// Make the `n`th `allocate` call (1-based) return null.
    pub fn fail_on_allocate(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Fill every fresh block with `byte`.
    pub fn poison(mut self, byte: u8) -> Self {
        self.poison = Some(byte);
        self
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn deallocate_calls(&self) -> usize {
        self.deallocate_calls.load(Ordering::SeqCst)
    }

    pub fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    pub fn live_blocks(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Start and capacity of the live block containing `addr`.
    pub fn block_containing(&self, addr: usize) -> Option<(usize, usize)> {
        let state = self.state.lock();
        let (&start, &cap) = state.live.range(..=addr).next_back()?;
        (addr < start + cap).then_some((start, cap))
    }

    fn place(&self, bump: usize, size: usize) -> Option<(usize, usize)> {
        let base = self.base.addr();
        let round16 = |n: usize| n.max(1).checked_next_multiple_of(16);
        let (start, capacity) = match self.placement {
            Placement::Natural => (base + bump.next_multiple_of(16), round16(size)?),
            Placement::SizeClass => {
                let capacity = size.max(16).checked_next_power_of_two()?;
                let align = capacity.min(ARENA_ALIGN);
                (base + bump.next_multiple_of(align), capacity)
            }
            Placement::Skewed => (base + bump.next_multiple_of(128) + 16, round16(size)?),
        };
        let end = start.checked_add(capacity)?;
        (end <= base + ARENA_BYTES).then_some((start, capacity))
    }

    fn resolve(&self, state: &ArenaState, ptr: *mut u8) -> (usize, usize) {
        let addr = ptr.addr();
        let (&start, &cap) = state
            .live
            .range(..=addr)
            .next_back()
            .filter(|(start, cap)| addr < **start + **cap)
            .unwrap_or_else(|| panic!("{addr:#x} is not a live arena block"));
        assert!(
            self.interior || start == addr,
            "interior pointer {addr:#x} passed to an arena that rejects them (block {start:#x})"
        );
        (start, cap)
    }
}

impl Drop for ArenaPrimitive {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this layout in new().
        unsafe { dealloc(self.base, Self::layout()) };
    }
}

unsafe impl PrimitiveAllocator for ArenaPrimitive {
    fn allocate(&self, size: usize) -> *mut u8 {
        let call = self.allocate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return std::ptr::null_mut();
        }
        self.gate.lock();
        let placed = {
            let mut state = self.state.lock();
            let placed = self.place(state.bump, size);
            if let Some((start, capacity)) = placed {
                state.bump = start + capacity - self.base.addr();
                state.live.insert(start, capacity);
            }
            placed
        };
        // SAFETY: paired with the lock above.
        unsafe { self.gate.unlock() };
        let Some((start, capacity)) = placed else {
            return std::ptr::null_mut();
        };
        let block = self.base.wrapping_add(start - self.base.addr());
        if let Some(byte) = self.poison {
            // SAFETY: the block spans capacity bytes inside the arena.
            unsafe { block.write_bytes(byte, capacity) };
        }
        block
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        self.deallocate_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.lock();
        {
            let mut state = self.state.lock();
            let (start, _) = self.resolve(&state, ptr);
            state.live.remove(&start);
        }
        // SAFETY: paired with the lock above.
        unsafe { self.gate.unlock() };
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let state = self.state.lock();
        let (start, cap) = self.resolve(&state, ptr);
        cap - (ptr.addr() - start)
    }

    fn lock(&self) {
        self.gate.lock();
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        // SAFETY: only called after lock() by the fork protocol.
        unsafe { self.gate.unlock() };
    }

    fn accepts_interior_pointers(&self) -> bool {
        self.interior
    }
}

pub fn ops(primitive: ArenaPrimitive) -> DerivedOps<ArenaPrimitive> {
    DerivedOps::with_config(primitive, WrapConfig::DEFAULT.with_trace(true))
}

pub fn leaked_ops(primitive: ArenaPrimitive) -> &'static DerivedOps<ArenaPrimitive> {
    Box::leak(Box::new(ops(primitive)))
}

/// xorshift64* for deterministic operation sequences.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}
