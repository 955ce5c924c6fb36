//! Relay counters.
//!
//! Unparseable output lines and unclaimed replies are dropped silently on the
//! wire; these counters keep them visible through `/health`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayStats {
    relayed: AtomicU64,
    timed_out: AtomicU64,
    unparseable_lines: AtomicU64,
    unclaimed_outputs: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub relayed: u64,
    pub timed_out: u64,
    pub unparseable_lines: u64,
    pub unclaimed_outputs: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unparseable_line(&self) {
        self.unparseable_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unclaimed_output(&self) {
        self.unclaimed_outputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            relayed: self.relayed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            unparseable_lines: self.unparseable_lines.load(Ordering::Relaxed),
            unclaimed_outputs: self.unclaimed_outputs.load(Ordering::Relaxed),
        }
    }
}
