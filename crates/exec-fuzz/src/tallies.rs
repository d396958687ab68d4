//! Process-wide atomic counters.
//!
//! Every tally is monotonic. Workers bump them with relaxed fetch-adds; no
//! ordering between different tallies is promised, only that each eventually
//! reflects the number of actions performed.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Tallies {
    /// Iterations handed out to workers.
    pub mutations: AtomicU64,
    /// Observations classified as crashes.
    pub crashes: AtomicU64,
    /// Crashes persisted with a fingerprint not seen before.
    pub unique_crashes: AtomicU64,
    /// Unique crashes that reproduced on every verifier re-run.
    pub verified_crashes: AtomicU64,
    /// Crashes dropped by the stack-hash or symbol lists.
    pub blacklisted_crashes: AtomicU64,
    /// Runs that exceeded the per-run timeout.
    pub timeouts: AtomicU64,
    /// Workers that have left their loop.
    pub threads_finished: AtomicU64,
}

impl Tallies {
    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            mutations: self.mutations.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            unique_crashes: self.unique_crashes.load(Ordering::Relaxed),
            verified_crashes: self.verified_crashes.load(Ordering::Relaxed),
            blacklisted_crashes: self.blacklisted_crashes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            threads_finished: self.threads_finished.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    pub mutations: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub verified_crashes: u64,
    pub blacklisted_crashes: u64,
    pub timeouts: u64,
    pub threads_finished: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let tallies = Tallies::default();
        tallies.mutations.fetch_add(3, Ordering::Relaxed);
        tallies.crashes.fetch_add(1, Ordering::Relaxed);
        let snap = tallies.snapshot();
        assert_eq!(snap.mutations, 3);
        assert_eq!(snap.crashes, 1);
        assert_eq!(snap.unique_crashes, 0);
    }
}
