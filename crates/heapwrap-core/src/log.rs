//! Structured lifecycle records.
//!
//! Records are `Copy` and live in a fixed-size ring so that recording never
//! calls back into the allocator. Tooling drains the ring; nothing here
//! writes to a stream.

use parking_lot::Mutex;
use serde::Serialize;

/// Number of records retained before the oldest are overwritten.
pub const LOG_CAPACITY: usize = 256;

/// Lifecycle record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One lifecycle event of the derived layer, descriptor or fork coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WrapLogRecord {
    /// Monotonic per-log event id (starts at 1).
    pub decision_id: u64,
    pub level: LogLevel,
    /// API symbol (`realloc`, `memalign`, `zone_register`, `fork_prepare`, ...).
    pub symbol: &'static str,
    /// Event kind (`realloc_in_place`, `memalign_over_allocate`, ...).
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub alignment: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
}

impl WrapLogRecord {
    /// Correlation id in the `heapwrap::{symbol}::{id}` form.
    #[must_use]
    pub fn trace_id(&self) -> String {
        format!("heapwrap::{}::{:016x}", self.symbol, self.decision_id)
    }
}

/// Fields supplied by a caller; the log assigns the decision id.
#[derive(Debug, Clone, Copy)]
pub struct LogEvent {
    pub level: LogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub alignment: Option<usize>,
    pub outcome: &'static str,
}

impl LogEvent {
    #[must_use]
    pub const fn new(
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            ptr: None,
            size: None,
            alignment: None,
            outcome,
        }
    }

    #[must_use]
    pub const fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

struct Ring {
    slots: [Option<WrapLogRecord>; LOG_CAPACITY],
    /// Index of the next slot to write.
    head: usize,
    len: usize,
    next_decision_id: u64,
    dropped: u64,
}

/// Bounded, allocation-free record buffer.
pub struct LifecycleLog {
    ring: Mutex<Ring>,
}

impl LifecycleLog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: parking_lot::const_mutex(Ring {
                slots: [None; LOG_CAPACITY],
                head: 0,
                len: 0,
                next_decision_id: 1,
                dropped: 0,
            }),
        }
    }

    /// Append an event, overwriting the oldest record when full.
    pub fn record(&self, event: LogEvent) -> u64 {
        let mut ring = self.ring.lock();
        Self::push(&mut ring, event)
    }

    /// Like [`record`](Self::record), but gives up instead of waiting.
    ///
    /// For paths that run right after `fork`, where another thread of the
    /// parent may have held the ring lock at the moment of duplication.
    pub fn try_record(&self, event: LogEvent) -> Option<u64> {
        let mut ring = self.ring.try_lock()?;
        Some(Self::push(&mut ring, event))
    }

    fn push(ring: &mut Ring, event: LogEvent) -> u64 {
        let decision_id = ring.next_decision_id;
        ring.next_decision_id = ring.next_decision_id.wrapping_add(1);
        let head = ring.head;
        ring.slots[head] = Some(WrapLogRecord {
            decision_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            alignment: event.alignment,
            outcome: event.outcome,
        });
        ring.head = (head + 1) % LOG_CAPACITY;
        if ring.len == LOG_CAPACITY {
            ring.dropped += 1;
        } else {
            ring.len += 1;
        }
        decision_id
    }

    /// Records currently retained, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WrapLogRecord> {
        let ring = self.ring.lock();
        let start = (ring.head + LOG_CAPACITY - ring.len) % LOG_CAPACITY;
        (0..ring.len)
            .filter_map(|i| ring.slots[(start + i) % LOG_CAPACITY])
            .collect()
    }

    /// Remove and return all retained records, oldest first.
    pub fn drain(&self) -> Vec<WrapLogRecord> {
        let mut ring = self.ring.lock();
        let start = (ring.head + LOG_CAPACITY - ring.len) % LOG_CAPACITY;
        let out = (0..ring.len)
            .filter_map(|i| ring.slots[(start + i) % LOG_CAPACITY].take())
            .collect();
        ring.len = 0;
        out
    }

    /// Records overwritten before anyone drained them.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring.lock().dropped
    }

    /// Take the ring lock and keep it past this call.
    ///
    /// Paired with [`thaw`](Self::thaw) around process duplication.
    pub(crate) fn freeze(&self) {
        std::mem::forget(self.ring.lock());
    }

    /// Release the lock taken by [`freeze`](Self::freeze).
    ///
    /// # Safety
    ///
    /// Must follow a `freeze` on this log that has not been thawed yet, in
    /// this process or in the parent it was duplicated from.
    pub(crate) unsafe fn thaw(&self) {
        // SAFETY: the caller guarantees the lock is held by a forgotten guard.
        unsafe { self.ring.force_unlock() };
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> impl Sized + '_ {
        self.ring.lock()
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new()
    }
}
