//! Fork-safety coordination.
//!
//! `prepare` runs in the forking thread before the address space is
//! duplicated. It takes the derived layer's side-table and lifecycle-ring
//! locks and then the primitive's lock, so neither resulting process
//! inherits a heap or bookkeeping structure that another thread was halfway
//! through mutating. Each process then releases all three exactly once via
//! its own resume hook.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::log::{LogEvent, LogLevel};
use crate::ops::DerivedOps;
use crate::primitive::PrimitiveAllocator;

/// Where the coordinator is in the fork protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ForkPhase {
    /// No fork in flight; the primitive is unlocked by us.
    Idle = 0,
    /// `prepare` has locked the primitive and no resume has run yet.
    Prepared = 1,
}

impl ForkPhase {
    const fn from_u8(raw: u8) -> Self {
        if raw == Self::Prepared as u8 {
            Self::Prepared
        } else {
            Self::Idle
        }
    }
}

/// Lock/unlock bracket around process duplication.
pub struct ForkCoordinator<'a, P> {
    ops: &'a DerivedOps<P>,
    phase: AtomicU8,
    prepares: AtomicU64,
    parent_resumes: AtomicU64,
    child_resumes: AtomicU64,
    unmatched_resumes: AtomicU64,
}

impl<'a, P: PrimitiveAllocator> ForkCoordinator<'a, P> {
    #[must_use]
    pub const fn new(ops: &'a DerivedOps<P>) -> Self {
        Self {
            ops,
            phase: AtomicU8::new(ForkPhase::Idle as u8),
            prepares: AtomicU64::new(0),
            parent_resumes: AtomicU64::new(0),
            child_resumes: AtomicU64::new(0),
            unmatched_resumes: AtomicU64::new(0),
        }
    }

    /// Runs before duplication: blocks until the derived layer and the
    /// primitive are quiescent.
    pub fn prepare(&self) {
        // Recorded before locking; the ring stays frozen until resume.
        self.ops.log().record(LogEvent::new(
            LogLevel::Info,
            "fork_prepare",
            "fork_lock",
            "locking",
        ));
        self.ops.freeze_side_state();
        self.ops.primitive().lock();
        self.prepares.fetch_add(1, Ordering::Relaxed);
        self.phase.store(ForkPhase::Prepared as u8, Ordering::Release);
    }

    /// Runs in the original process after duplication.
    pub fn parent_resume(&self) {
        self.resume("fork_parent", &self.parent_resumes);
    }

    /// Runs in the new process after duplication.
    pub fn child_resume(&self) {
        self.resume("fork_child", &self.child_resumes);
    }

    fn resume(&self, symbol: &'static str, counter: &AtomicU64) {
        let released = self
            .phase
            .compare_exchange(
                ForkPhase::Prepared as u8,
                ForkPhase::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !released {
            self.unmatched_resumes.fetch_add(1, Ordering::Relaxed);
            self.ops.log().try_record(LogEvent::new(
                LogLevel::Error,
                symbol,
                "fork_resume_without_prepare",
                "skipped",
            ));
            return;
        }
        self.ops.primitive().unlock();
        // SAFETY: the Prepared phase means `prepare` froze the side state and
        // no resume has thawed it since.
        unsafe { self.ops.thaw_side_state() };
        counter.fetch_add(1, Ordering::Relaxed);
        self.ops.log().try_record(LogEvent::new(
            LogLevel::Info,
            symbol,
            "fork_unlock",
            "success",
        ));
    }

    #[must_use]
    pub fn phase(&self) -> ForkPhase {
        ForkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn prepares(&self) -> u64 {
        self.prepares.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn parent_resumes(&self) -> u64 {
        self.parent_resumes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn child_resumes(&self) -> u64 {
        self.child_resumes.load(Ordering::Relaxed)
    }

    /// Resume hooks that ran with no `prepare` in flight.
    #[must_use]
    pub fn unmatched_resumes(&self) -> u64 {
        self.unmatched_resumes.load(Ordering::Relaxed)
    }
}
