//! Manager-level metrics (aggregate across all instances).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::instance::StatusCounts;

/// Storage for manager-wide counters.
///
/// All counters are monotonic (never decrease).
#[derive(Clone, Default, Debug)]
pub struct ManagerMetricsStorage {
    pub(crate) starts: Arc<AtomicU64>,
    pub(crate) start_failures: Arc<AtomicU64>,
    pub(crate) stops: Arc<AtomicU64>,
    /// Stops that needed SIGKILL.
    pub(crate) forced_kills: Arc<AtomicU64>,
    pub(crate) restarts: Arc<AtomicU64>,
    pub(crate) unexpected_exits: Arc<AtomicU64>,
    pub(crate) probe_failures: Arc<AtomicU64>,
}

impl ManagerMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters together with the current status breakdown.
    pub fn snapshot(&self, statuses: StatusCounts) -> ManagerMetrics {
        ManagerMetrics {
            starts_total: self.starts.load(Ordering::Relaxed),
            start_failures_total: self.start_failures.load(Ordering::Relaxed),
            stops_total: self.stops.load(Ordering::Relaxed),
            forced_kills_total: self.forced_kills.load(Ordering::Relaxed),
            restarts_total: self.restarts.load(Ordering::Relaxed),
            unexpected_exits_total: self.unexpected_exits.load(Ordering::Relaxed),
            probe_failures_total: self.probe_failures.load(Ordering::Relaxed),
            running: statuses.running,
            statuses,
        }
    }
}

/// Point-in-time copy of the manager counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerMetrics {
    /// Successful starts, including the start half of restarts.
    pub starts_total: u64,
    pub start_failures_total: u64,
    pub stops_total: u64,
    pub forced_kills_total: u64,
    pub restarts_total: u64,
    pub unexpected_exits_total: u64,
    pub probe_failures_total: u64,
    /// Instances currently running.
    pub running: usize,
    pub statuses: StatusCounts,
}
