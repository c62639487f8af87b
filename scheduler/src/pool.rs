//! Registry of workers keyed by id, with pluggable selection strategies.
//!
//! Mirrors the shape of a generic capability worker pool: a concurrent map
//! from key to worker state, atomic load counters, and a small set of
//! selection strategies layered on top of a single `available()` predicate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::worker::{Worker, WorkerRole, WorkerSeed, WorkerStatus, DEFAULT_MAX_CONCURRENCY};

/// Worker selection strategy, chosen per dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    LatencyAware,
}

/// Patch applied by a health probe or operator action.
#[derive(Debug, Clone, Default)]
pub struct MetricsPatch {
    pub gpu_utilization: Option<f64>,
    pub active_requests: Option<usize>,
    pub status: Option<WorkerStatus>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registry of workers keyed by id.
///
/// Owns the worker map exclusively; all mutation of worker state goes
/// through its methods so invariants (`active_requests <= max_concurrency`,
/// `status` consistency) hold at every observable point.
pub struct WorkerPool {
    workers: DashMap<String, Worker>,
    round_robin_prefill: AtomicUsize,
    round_robin_decode: AtomicUsize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            round_robin_prefill: AtomicUsize::new(0),
            round_robin_decode: AtomicUsize::new(0),
        }
    }

    /// Register (or re-register) a worker.
    ///
    /// If `id` already exists, `status`, `gpu_utilization` and `active_requests`
    /// carry over untouched; otherwise the worker starts `{idle, 0, 0}`.
    /// `endpoint`, `role`, `model_id` and `max_concurrency` are always updated,
    /// and `last_health_check` is always reset to now.
    pub fn register(&self, seed: WorkerSeed) -> Worker {
        let max_concurrency = seed.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        let worker = self
            .workers
            .entry(seed.id.clone())
            .and_modify(|w| {
                debug!(worker_id = %seed.id, "worker re-registered");
                w.endpoint = seed.endpoint.clone();
                w.role = seed.role;
                w.model_id = seed.model_id.clone();
                w.max_concurrency = max_concurrency;
                w.last_health_check = now_ms();
            })
            .or_insert_with(|| Worker {
                id: seed.id.clone(),
                endpoint: seed.endpoint.clone(),
                role: seed.role,
                status: WorkerStatus::Idle,
                gpu_utilization: 0.0,
                active_requests: 0,
                max_concurrency,
                last_health_check: now_ms(),
                model_id: seed.model_id.clone(),
            });
        worker.clone()
    }

    /// Remove a worker from the registry. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.workers.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.workers.get(id).map(|w| w.clone())
    }

    /// All registered workers, optionally filtered by role.
    pub fn list(&self, role: Option<WorkerRole>) -> Vec<Worker> {
        self.workers
            .iter()
            .filter(|w| role.is_none_or(|r| w.role == r))
            .map(|w| w.clone())
            .collect()
    }

    /// Workers of `role` that are not draining/offline and have spare capacity.
    pub fn available(&self, role: WorkerRole) -> Vec<Worker> {
        self.workers
            .iter()
            .filter(|w| w.role == role && w.is_available())
            .map(|w| w.clone())
            .collect()
    }

    /// Select one available worker of `role` per `strategy`. `None` if none are available.
    pub fn select(&self, role: WorkerRole, strategy: SelectionStrategy) -> Option<Worker> {
        let candidates = self.available(role);
        if candidates.is_empty() {
            return None;
        }

        match strategy {
            SelectionStrategy::RoundRobin => {
                let counter = match role {
                    WorkerRole::Prefill => &self.round_robin_prefill,
                    WorkerRole::Decode => &self.round_robin_decode,
                };
                // Advances on every call, even when the index lands on a
                // worker that another caller has since taken, matching the
                // "counter advances regardless of outcome" contract.
                let idx = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].clone())
            }
            SelectionStrategy::LeastLoaded => candidates
                .into_iter()
                .min_by_key(|w| w.active_requests)
                .map(Some)
                .unwrap_or(None),
            SelectionStrategy::LatencyAware => candidates
                .into_iter()
                .min_by(|a, b| {
                    a.gpu_utilization
                        .partial_cmp(&b.gpu_utilization)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(Some)
                .unwrap_or(None),
        }
    }

    /// Increment `active_requests`, recomputing `busy`/`idle` status.
    pub fn increment_active(&self, id: &str) {
        if let Some(mut w) = self.workers.get_mut(id) {
            let before = w.status;
            w.active_requests = w.active_requests.saturating_add(1);
            w.recompute_status();
            if w.status != before {
                debug!(worker_id = id, from = ?before, to = ?w.status, "worker status changed");
            }
        }
    }

    /// Decrement `active_requests`, clamped at zero, recomputing status.
    pub fn decrement_active(&self, id: &str) {
        if let Some(mut w) = self.workers.get_mut(id) {
            let before = w.status;
            w.active_requests = w.active_requests.saturating_sub(1);
            w.recompute_status();
            if w.status != before {
                debug!(worker_id = id, from = ?before, to = ?w.status, "worker status changed");
            }
        }
    }

    /// Apply a health-probe or operator patch; always refreshes `last_health_check`.
    pub fn update_metrics(&self, id: &str, patch: MetricsPatch) {
        if let Some(mut w) = self.workers.get_mut(id) {
            if let Some(util) = patch.gpu_utilization {
                w.gpu_utilization = util;
            }
            if let Some(active) = patch.active_requests {
                w.active_requests = active;
            }
            if let Some(status) = patch.status {
                w.status = status;
            }
            w.last_health_check = now_ms();
        }
    }

    /// Mark a worker offline (sticky until a successful probe or re-registration).
    pub fn mark_offline(&self, id: &str) {
        if let Some(mut w) = self.workers.get_mut(id) {
            warn!(worker_id = id, "worker marked offline");
            w.status = WorkerStatus::Offline;
        }
    }

    /// Operator-driven admin action: exclude a worker from `available()`
    /// without removing it. Never invoked by the scheduling core itself.
    pub fn drain(&self, id: &str) {
        if let Some(mut w) = self.workers.get_mut(id) {
            debug!(worker_id = id, "worker draining");
            w.status = WorkerStatus::Draining;
        }
    }

    /// Mark every non-offline worker stale for more than `timeout_ms` as offline.
    /// Returns the ids that transitioned.
    pub fn expire_stale_workers(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut expired = Vec::new();
        for mut entry in self.workers.iter_mut() {
            if entry.status != WorkerStatus::Offline
                && now.saturating_sub(entry.last_health_check) > timeout_ms
            {
                entry.status = WorkerStatus::Offline;
                expired.push(entry.id.clone());
            }
        }
        for id in &expired {
            warn!(worker_id = id, timeout_ms, "worker stale, marked offline");
        }
        expired
    }
}
