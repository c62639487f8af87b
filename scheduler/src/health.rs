//! Periodic health probes, stale-worker eviction, rolling latency windows,
//! metric snapshotting, and the event log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::WorkerClient;
use crate::events::{now_ms, Event, EventLog};
use crate::metrics::{SchedulerMetrics, WorkerSnapshot};
use crate::pool::{MetricsPatch, WorkerPool};
use crate::worker::{WorkerRole, WorkerStatus};

/// Fixed-capacity rolling window of latency samples (oldest-out on overflow).
pub const LATENCY_WINDOW_CAPACITY: usize = 200;

/// Rolling window over the last [`LATENCY_WINDOW_CAPACITY`] samples for one
/// latency series (total, prefill, or decode).
#[derive(Default)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_CAPACITY)),
        }
    }

    pub fn record(&self, sample_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == LATENCY_WINDOW_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(sample_ms);
    }

    /// Integer-rounded arithmetic mean, 0 if empty.
    pub fn average(&self) -> u64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0;
        }
        let sum: u64 = samples.iter().sum();
        // Round-to-nearest rather than truncate.
        (sum + samples.len() as u64 / 2) / samples.len() as u64
    }
}

/// Owns health-probe counters, latency windows, and the event log.
pub struct HealthMonitor {
    completed: AtomicU64,
    failed: AtomicU64,
    total_latency: LatencyWindow,
    prefill_latency: LatencyWindow,
    decode_latency: LatencyWindow,
    events: EventLog,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_latency: LatencyWindow::new(),
            prefill_latency: LatencyWindow::new(),
            decode_latency: LatencyWindow::new(),
            events: EventLog::new(),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn record_completion(&self, total_ms: u64, prefill_ms: u64, decode_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency.record(total_ms);
        self.prefill_latency.record(prefill_ms);
        self.decode_latency.record(decode_ms);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Probe every registered worker concurrently; patch the pool with the
    /// result, or mark offline on an unhealthy/unreachable probe. Also
    /// expires workers that have gone stale since their last successful
    /// probe. Never blocks the overall tick on one slow worker beyond its
    /// own probe deadline (each probe carries its own timeout internally).
    pub async fn tick(
        &self,
        pool: &Arc<WorkerPool>,
        client: &Arc<dyn WorkerClient>,
        worker_timeout_ms: u64,
    ) {
        let workers = pool.list(None);
        let probes = workers.into_iter().map(|worker| {
            let pool = Arc::clone(pool);
            let client = Arc::clone(client);
            let id = worker.id.clone();
            let role = worker.role;
            async move {
                let result = client.health(&worker).await;
                if result.healthy {
                    let status = if result.active_requests >= worker.max_concurrency {
                        WorkerStatus::Busy
                    } else {
                        WorkerStatus::Idle
                    };
                    debug!(
                        worker_id = %id,
                        gpu_utilization = result.gpu_utilization,
                        active_requests = result.active_requests,
                        "health probe ok"
                    );
                    pool.update_metrics(
                        &id,
                        MetricsPatch {
                            gpu_utilization: Some(result.gpu_utilization),
                            active_requests: Some(result.active_requests),
                            status: Some(status),
                        },
                    );
                    None
                } else {
                    warn!(
                        worker_id = %id,
                        error = result.error.as_deref().unwrap_or("unhealthy"),
                        "health probe failed"
                    );
                    pool.mark_offline(&id);
                    Some((id, role))
                }
            }
        });

        for offline in futures::future::join_all(probes).await.into_iter().flatten() {
            self.events.emit(Event::WorkerOffline {
                worker_id: offline.0,
                timestamp: now_ms(),
            });
        }

        for id in pool.expire_stale_workers(worker_timeout_ms) {
            self.events.emit(Event::WorkerOffline {
                worker_id: id,
                timestamp: now_ms(),
            });
        }
    }

    pub fn snapshot(
        &self,
        pool: &WorkerPool,
        queue_depth: usize,
        active_prefills: usize,
        active_transfers: usize,
        active_decodes: usize,
    ) -> SchedulerMetrics {
        SchedulerMetrics {
            queue_depth,
            active_prefills,
            active_transfers,
            active_decodes,
            total_completed: self.completed.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: self.total_latency.average(),
            avg_prefill_latency_ms: self.prefill_latency.average(),
            avg_decode_latency_ms: self.decode_latency.average(),
            workers: pool
                .list(None)
                .into_iter()
                .map(|w| WorkerSnapshot {
                    id: w.id,
                    role: worker_role_label(w.role),
                    status: worker_status_label(w.status),
                    gpu_utilization: w.gpu_utilization,
                    active_requests: w.active_requests,
                })
                .collect(),
        }
    }
}

fn worker_role_label(role: WorkerRole) -> &'static str {
    match role {
        WorkerRole::Prefill => "prefill",
        WorkerRole::Decode => "decode",
    }
}

fn worker_status_label(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Idle => "idle",
        WorkerStatus::Busy => "busy",
        WorkerStatus::Draining => "draining",
        WorkerStatus::Offline => "offline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_window_average_is_rounded_mean_or_zero() {
        let window = LatencyWindow::new();
        assert_eq!(window.average(), 0);
        window.record(10);
        window.record(11);
        // mean = 10.5, rounds to 11
        assert_eq!(window.average(), 11);
    }

    #[test]
    fn latency_window_drops_oldest_past_capacity() {
        let window = LatencyWindow::new();
        for i in 0..(LATENCY_WINDOW_CAPACITY as u64 + 5) {
            window.record(i);
        }
        // Oldest 5 samples (0..5) should have rolled off; mean shifts up accordingly.
        let expected_sum: u64 = (5..(LATENCY_WINDOW_CAPACITY as u64 + 5)).sum();
        let expected_avg = (expected_sum + LATENCY_WINDOW_CAPACITY as u64 / 2)
            / LATENCY_WINDOW_CAPACITY as u64;
        assert_eq!(window.average(), expected_avg);
    }
}
