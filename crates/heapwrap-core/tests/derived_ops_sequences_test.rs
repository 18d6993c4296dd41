mod common;

use common::{ArenaPrimitive, Placement, XorShift64, ops};
use heapwrap_core::Reallocated;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Live,
}

fn stamp(ptr: *mut u8, len: usize, tag: u8) {
    // SAFETY: callers pass a live block with at least len usable bytes.
    unsafe { ptr.write_bytes(tag, len) };
}

fn stamped(ptr: *const u8, len: usize, tag: u8) -> bool {
    // SAFETY: callers pass a live block with at least len usable bytes.
    unsafe { std::slice::from_raw_parts(ptr, len) }
        .iter()
        .all(|&b| b == tag)
}

#[test]
fn deterministic_sequences_keep_usable_size_and_contents() {
    // Bounded invariant pressure; the fuzz target covers the open-ended case.
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 2_000;
    const SLOTS: usize = 24;

    for seed in SEEDS {
        for (placement, interior) in [
            (Placement::Natural, true),
            (Placement::SizeClass, true),
            (Placement::Skewed, false),
        ] {
            let ops = ops(
                ArenaPrimitive::new()
                    .placement(placement)
                    .interior_pointers(interior),
            );
            let mut rng = XorShift64::new(seed);
            let mut ptrs = [std::ptr::null_mut::<u8>(); SLOTS];
            let mut sizes = [0usize; SLOTS];
            let mut tags = [0u8; SLOTS];
            let mut states = [SlotState::Empty; SLOTS];

            for step in 0..STEPS {
                let slot = rng.gen_range_usize(0, SLOTS - 1);
                let ctx = format!("seed={seed} {placement:?} step={step} slot={slot}");
                match (states[slot], rng.gen_range_usize(0, 3)) {
                    (SlotState::Empty, 0 | 1) => {
                        let size = rng.gen_range_usize(1, 2048);
                        let p = ops.malloc(size).unwrap().as_ptr();
                        (ptrs[slot], sizes[slot], tags[slot]) = (p, size, step as u8);
                        states[slot] = SlotState::Live;
                    }
                    (SlotState::Empty, _) => {
                        let alignment = 1usize << rng.gen_range_usize(4, 12);
                        let size = rng.gen_range_usize(1, 1024);
                        let p = ops.memalign(alignment, size).unwrap().as_ptr();
                        assert_eq!(p.addr() % alignment, 0, "{ctx}");
                        (ptrs[slot], sizes[slot], tags[slot]) = (p, size, step as u8);
                        states[slot] = SlotState::Live;
                    }
                    (SlotState::Live, 0) => {
                        assert!(stamped(ptrs[slot], sizes[slot], tags[slot]), "{ctx}");
                        unsafe { ops.free(ptrs[slot]) };
                        states[slot] = SlotState::Empty;
                        continue;
                    }
                    (SlotState::Live, _) => {
                        let old = sizes[slot];
                        let size = rng.gen_range_usize(1, 4096);
                        let r = unsafe { ops.realloc(ptrs[slot], size) }.unwrap();
                        let p = r.as_ptr();
                        if let Reallocated::InPlace(_) = r {
                            assert_eq!(p, ptrs[slot], "{ctx}");
                        }
                        assert!(stamped(p, old.min(size), tags[slot]), "{ctx}");
                        (ptrs[slot], sizes[slot]) = (p, size);
                    }
                }
                let usable = unsafe { ops.usable_size(ptrs[slot]) };
                assert!(usable >= sizes[slot], "{ctx}: usable {usable} < {}", sizes[slot]);
                stamp(ptrs[slot], sizes[slot], tags[slot]);
            }

            for slot in 0..SLOTS {
                if states[slot] == SlotState::Live {
                    unsafe { ops.free(ptrs[slot]) };
                }
            }
            assert_eq!(ops.primitive().live_blocks(), 0, "seed={seed} {placement:?}");
            assert_eq!(ops.tracked_aligned_blocks(), 0);
        }
    }
}
