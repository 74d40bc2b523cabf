//! Per-cycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CycleStats {
    accepted: AtomicU64,
    failed: AtomicU64,
    insufficient_retries: AtomicU64,
    collision_retries: AtomicU64,
    reallocations: AtomicU64,
    challenges: AtomicU64,
}

/// Point-in-time copy of `CycleStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests handed to the consumer.
    pub accepted: u64,
    /// Accepts that ended in an error.
    pub failed: u64,
    /// Receives retried with a larger buffer.
    pub insufficient_retries: u64,
    /// Receives retried after a stale continuation id.
    pub collision_retries: u64,
    /// Native request allocations.
    pub reallocations: u64,
    /// Requests that got an auth challenge instead of dispatch.
    pub challenges: u64,
}

impl CycleStats {
    #[inline]
    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn insufficient_retry(&self) {
        self.insufficient_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn collision_retry(&self) {
        self.collision_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn reallocation(&self) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn challenge(&self) {
        self.challenges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            insufficient_retries: self.insufficient_retries.load(Ordering::Relaxed),
            collision_retries: self.collision_retries.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
            challenges: self.challenges.load(Ordering::Relaxed),
        }
    }
}
