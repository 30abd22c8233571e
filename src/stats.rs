//! Event counters embedded in every structure.
//!
//! Handlers running in interrupt context cannot log, so each structure records
//! what happened to it in a set of relaxed atomic counters. A [`Snapshot`] can
//! be taken from normal context at any time.

use core::fmt;
use portable_atomic::{AtomicUsize, Ordering};

/// Relaxed event counters for one structure instance.
///
/// The meaning of each counter depends on the owning structure; see the
/// `stats()` method of each type.
#[repr(align(64))]
pub(crate) struct Counters {
    acquired: AtomicUsize,
    unavailable: AtomicUsize,
    completed: AtomicUsize,
    retries: AtomicUsize,
    helped: AtomicUsize,
}

impl Counters {
    pub(crate) const fn new() -> Self {
        Self {
            acquired: AtomicUsize::new(0),
            unavailable: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            helped: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_retries(&self, count: usize) {
        if count > 0 {
            self.retries.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub(crate) fn record_helped(&self) {
        self.helped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            helped: self.helped.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters. Exposed as `reset_stats()` on each structure.
    pub(crate) fn reset(&self) {
        self.acquired.store(0, Ordering::Relaxed);
        self.unavailable.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.helped.store(0, Ordering::Relaxed);
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of one structure's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Successful acquisitions (or operations started, for `Mcas`)
    pub acquired: usize,
    /// Acquisitions refused because nothing was available
    pub unavailable: usize,
    /// Releases, commits or completed operations
    pub completed: usize,
    /// Extra CAS attempts or scan steps caused by contention
    pub retries: usize,
    /// Work done on behalf of another context
    pub helped: usize,
}

impl Snapshot {
    /// Fraction of acquisitions that were refused.
    pub fn unavailable_ratio(&self) -> f32 {
        let total = self.acquired + self.unavailable;
        if total > 0 {
            self.unavailable as f32 / total as f32
        } else {
            0.0
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquired={} unavailable={} completed={} retries={} helped={}",
            self.acquired, self.unavailable, self.completed, self.retries, self.helped
        )
    }
}
