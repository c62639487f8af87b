//! The metrics snapshot returned by `Scheduler::metrics()`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub role: &'static str,
    pub status: &'static str,
    pub gpu_utilization: f64,
    pub active_requests: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub queue_depth: usize,
    pub active_prefills: usize,
    pub active_transfers: usize,
    pub active_decodes: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub avg_latency_ms: u64,
    pub avg_prefill_latency_ms: u64,
    pub avg_decode_latency_ms: u64,
    pub workers: Vec<WorkerSnapshot>,
}
