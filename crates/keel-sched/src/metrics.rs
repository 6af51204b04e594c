//! Scheduler counters.
//!
//! [`SchedMetrics`] is the plain snapshot handed to callers; the live
//! counters are atomics inside the job system, bumped on the hot paths
//! and read without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the scheduler's cumulative counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedMetrics {
    /// Jobs published (excluding permit-expansion slots).
    pub jobs_scheduled: u64,
    /// Jobs finalised.
    pub jobs_completed: u64,
    /// Ready successors run inline by the finishing worker instead of
    /// going through the ready queue.
    pub inline_dispatches: u64,
    /// Permit-expansion slots borrowed from the pool.
    pub permit_expansions: u64,
    /// Parameters too large for inline storage.
    pub external_params: u64,
    /// Enqueue retries caused by a transiently full ready/free queue.
    pub queue_full_retries: u64,
}

/// Live counters; one instance per job system.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub jobs_scheduled: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub inline_dispatches: AtomicU64,
    pub permit_expansions: AtomicU64,
    pub external_params: AtomicU64,
    pub queue_full_retries: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> SchedMetrics {
        SchedMetrics {
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            inline_dispatches: self.inline_dispatches.load(Ordering::Relaxed),
            permit_expansions: self.permit_expansions.load(Ordering::Relaxed),
            external_params: self.external_params.load(Ordering::Relaxed),
            queue_full_retries: self.queue_full_retries.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
