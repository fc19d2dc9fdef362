//! Operation counters for the storage-policy subsystem.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters, incremented on the request path with relaxed
/// ordering.
#[derive(Default)]
pub struct Metrics {
    /// SIZE diversifications created locally.
    pub size_diversifications: AtomicU64,
    /// FREQUENCY diversifications created locally.
    pub frequency_diversifications: AtomicU64,
    /// Resolve calls served.
    pub resolves: AtomicU64,
    /// Resolve calls cut short by the depth bound.
    pub depth_limit_hits: AtomicU64,
    /// Key-block directives installed.
    pub key_blocks_accepted: AtomicU64,
    /// Key-block directives dropped (precedence, staleness or signature).
    pub key_blocks_rejected: AtomicU64,
    /// Directives dropped by the anti-spam filter without verification.
    pub spam_short_circuits: AtomicU64,
    /// Durable writes that failed (in-memory state stayed authoritative).
    pub persistence_failures: AtomicU64,
}

impl Metrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            size_diversifications: self.size_diversifications.load(Ordering::Relaxed),
            frequency_diversifications: self.frequency_diversifications.load(Ordering::Relaxed),
            resolves: self.resolves.load(Ordering::Relaxed),
            depth_limit_hits: self.depth_limit_hits.load(Ordering::Relaxed),
            key_blocks_accepted: self.key_blocks_accepted.load(Ordering::Relaxed),
            key_blocks_rejected: self.key_blocks_rejected.load(Ordering::Relaxed),
            spam_short_circuits: self.spam_short_circuits.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`Metrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub size_diversifications: u64,
    pub frequency_diversifications: u64,
    pub resolves: u64,
    pub depth_limit_hits: u64,
    pub key_blocks_accepted: u64,
    pub key_blocks_rejected: u64,
    pub spam_short_circuits: u64,
    pub persistence_failures: u64,
}
