//! Side table for over-allocated aligned blocks.
//!
//! The last memalign strategy hands out an address inside a larger block.
//! Primitives that cannot free interior pointers need that address mapped
//! back to the block start; this table holds the mapping. It is a fixed-size
//! open-addressing hash so that lookups never allocate.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Maximum number of live over-allocated blocks tracked at once.
pub const ORIGIN_CAPACITY: usize = 1024;

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Slot {
    aligned: usize,
    origin: usize,
}

struct Table {
    slots: [Slot; ORIGIN_CAPACITY],
    live: usize,
}

impl Table {
    fn home(aligned: usize) -> usize {
        // Aligned addresses have many low zero bits; mix before masking.
        let mixed = (aligned as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        mixed as usize % ORIGIN_CAPACITY
    }

    fn find(&self, aligned: usize) -> Option<usize> {
        let home = Self::home(aligned);
        for step in 0..ORIGIN_CAPACITY {
            let idx = (home + step) % ORIGIN_CAPACITY;
            match self.slots[idx].aligned {
                EMPTY => return None,
                a if a == aligned => return Some(idx),
                _ => {}
            }
        }
        None
    }
}

/// Map from aligned interior address to the start of its block.
pub struct AlignedOrigins {
    table: Mutex<Table>,
    /// Mirror of `Table::live` so lookups on an empty table skip the lock.
    tracked: AtomicUsize,
}

impl AlignedOrigins {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: parking_lot::const_mutex(Table {
                slots: [Slot {
                    aligned: EMPTY,
                    origin: EMPTY,
                }; ORIGIN_CAPACITY],
                live: 0,
            }),
            tracked: AtomicUsize::new(0),
        }
    }

    /// Record that `aligned` lives inside the block starting at `origin`.
    ///
    /// Returns false when the table is full.
    pub fn insert(&self, aligned: usize, origin: usize) -> bool {
        debug_assert!(aligned != EMPTY && aligned != TOMBSTONE);
        let mut table = self.table.lock();
        if table.live == ORIGIN_CAPACITY {
            return false;
        }
        let home = Table::home(aligned);
        let mut reuse = None;
        for step in 0..ORIGIN_CAPACITY {
            let idx = (home + step) % ORIGIN_CAPACITY;
            match table.slots[idx].aligned {
                EMPTY => {
                    reuse = reuse.or(Some(idx));
                    break;
                }
                TOMBSTONE => {
                    reuse = reuse.or(Some(idx));
                }
                a if a == aligned => {
                    reuse = Some(idx);
                    table.live -= 1;
                    break;
                }
                _ => {}
            }
        }
        let Some(idx) = reuse else {
            return false;
        };
        table.slots[idx] = Slot { aligned, origin };
        table.live += 1;
        self.tracked.store(table.live, Ordering::Release);
        true
    }

    /// Block start for `aligned`, if it was handed out by the fallback path.
    #[must_use]
    pub fn origin_of(&self, aligned: usize) -> Option<usize> {
        if aligned == EMPTY || self.tracked.load(Ordering::Acquire) == 0 {
            return None;
        }
        let table = self.table.lock();
        if table.live == 0 {
            return None;
        }
        table.find(aligned).map(|idx| table.slots[idx].origin)
    }

    /// Remove the entry for `aligned`, returning its block start.
    pub fn take(&self, aligned: usize) -> Option<usize> {
        if aligned == EMPTY || self.tracked.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut table = self.table.lock();
        if table.live == 0 {
            return None;
        }
        let idx = table.find(aligned)?;
        let origin = table.slots[idx].origin;
        table.slots[idx] = Slot {
            aligned: TOMBSTONE,
            origin: EMPTY,
        };
        table.live -= 1;
        self.tracked.store(table.live, Ordering::Release);
        Some(origin)
    }

    /// Number of tracked blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the table lock and keep it past this call.
    ///
    /// Paired with [`thaw`](Self::thaw) around process duplication.
    pub(crate) fn freeze(&self) {
        std::mem::forget(self.table.lock());
    }

    /// Release the lock taken by [`freeze`](Self::freeze).
    ///
    /// # Safety
    ///
    /// Must follow a `freeze` on this table that has not been thawed yet,
    /// in this process or in the parent it was duplicated from.
    pub(crate) unsafe fn thaw(&self) {
        // SAFETY: the caller guarantees the lock is held by a forgotten guard.
        unsafe { self.table.force_unlock() };
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> impl Sized + '_ {
        self.table.lock()
    }
}

impl Default for AlignedOrigins {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_take() {
        let origins = AlignedOrigins::new();
        assert!(origins.insert(0x1040, 0x1010));
        assert_eq!(origins.origin_of(0x1040), Some(0x1010));
        assert_eq!(origins.len(), 1);
        assert_eq!(origins.take(0x1040), Some(0x1010));
        assert_eq!(origins.origin_of(0x1040), None);
        assert!(origins.is_empty());
    }

    #[test]
    fn unknown_and_null_addresses_miss() {
        let origins = AlignedOrigins::new();
        assert_eq!(origins.origin_of(0), None);
        assert_eq!(origins.take(0xdead_0000), None);
        origins.insert(0x2000, 0x1ff0);
        assert_eq!(origins.origin_of(0x3000), None);
    }

    #[test]
    fn reinserting_same_address_replaces_origin() {
        let origins = AlignedOrigins::new();
        origins.insert(0x4000, 0x3ff0);
        origins.insert(0x4000, 0x3fe0);
        assert_eq!(origins.len(), 1);
        assert_eq!(origins.take(0x4000), Some(0x3fe0));
    }

    #[test]
    fn full_table_rejects_and_tombstones_are_reused() {
        let origins = AlignedOrigins::new();
        for i in 1..=ORIGIN_CAPACITY {
            assert!(origins.insert(i * 0x1000, i * 0x1000 - 0x10));
        }
        assert!(!origins.insert(0xFFFF_0000, 0xFFFE_FFF0));
        for i in 1..=ORIGIN_CAPACITY / 2 {
            assert_eq!(origins.take(i * 0x1000), Some(i * 0x1000 - 0x10));
        }
        for i in 0..ORIGIN_CAPACITY / 2 {
            assert!(origins.insert(0x1_0000_0000 + i * 0x40, 0x10));
        }
        assert_eq!(origins.len(), ORIGIN_CAPACITY);
        let last = ORIGIN_CAPACITY * 0x1000;
        assert_eq!(origins.origin_of(last), Some(last - 0x10));
    }

    #[test]
    fn frozen_table_blocks_until_thawed() {
        let origins = AlignedOrigins::new();
        origins.insert(0x8000, 0x7ff0);
        origins.freeze();
        assert!(origins.table.try_lock().is_none());
        unsafe { origins.thaw() };
        assert_eq!(origins.take(0x8000), Some(0x7ff0));
    }
}
