//! Worker registry entries: role, status, and load bookkeeping.

use serde::{Deserialize, Serialize};

/// Which phase of the pipeline a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Prefill,
    Decode,
}

/// Lifecycle status of a worker, driven by load and health probes.
///
/// `Idle` and `Busy` are derived from load (see [`Worker::recompute_status`]);
/// `Offline` is sticky until a successful health probe or re-registration;
/// `Draining` is operator-driven and never entered by the core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

/// A registered prefill or decode worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub endpoint: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    pub gpu_utilization: f64,
    pub active_requests: usize,
    pub max_concurrency: usize,
    pub last_health_check: u64,
    pub model_id: String,
}

/// Fields accepted by [`crate::pool::WorkerPool::register`].
#[derive(Debug, Clone)]
pub struct WorkerSeed {
    pub id: String,
    pub endpoint: String,
    pub role: WorkerRole,
    pub model_id: String,
    pub max_concurrency: Option<usize>,
}

pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

impl Worker {
    /// `status in {idle, busy}` and there is headroom for another request.
    pub fn is_available(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
            && self.active_requests < self.max_concurrency
    }

    /// Re-derive `idle`/`busy` from `active_requests`, without touching
    /// `offline`/`draining` (those are only changed by health/operator paths).
    pub fn recompute_status(&mut self) {
        if matches!(self.status, WorkerStatus::Offline | WorkerStatus::Draining) {
            return;
        }
        self.status = if self.active_requests >= self.max_concurrency {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
    }
}
