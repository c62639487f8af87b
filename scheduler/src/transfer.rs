//! Bounded-concurrency KV-cache transfer orchestrator with a FIFO overflow queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::client::WorkerClient;
use crate::worker::Worker;

/// A single request's half of a KV cache move.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub request_id: String,
    pub source: Worker,
    pub target: Worker,
    pub source_cache_handle: String,
}

/// Outcome of a transfer. Errors never propagate as exceptions out of
/// `transfer` — they are encoded here, isolating the scheduler from
/// transport faults while preserving FIFO ordering.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub success: bool,
    pub transfer_duration_ms: u64,
    pub target_cache_handle: Option<String>,
    pub error: Option<String>,
}

struct PendingJob {
    job: TransferJob,
    resolver: oneshot::Sender<TransferResult>,
}

/// Bounded-concurrency transfer orchestrator.
///
/// Owns its pending list and active counter exclusively. At most
/// `max_concurrent` transfers run at once; the rest wait strictly FIFO.
pub struct KVTransferManager {
    client: Arc<dyn WorkerClient>,
    max_concurrent: usize,
    timeout: Duration,
    active: AtomicUsize,
    pending: Mutex<VecDeque<PendingJob>>,
}

impl KVTransferManager {
    pub fn new(client: Arc<dyn WorkerClient>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            client,
            max_concurrent,
            timeout,
            active: AtomicUsize::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Current number of transfers actually running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Current number of transfers waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run `job`, or wait FIFO for a free slot. Resolves with a result
    /// object — it is never an `Err` itself (transport failures are
    /// encoded inside [`TransferResult`]).
    pub async fn transfer(self: &Arc<Self>, job: TransferJob) -> TransferResult {
        if self.try_reserve_slot() {
            self.run_reserved(job).await
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push_back(PendingJob { job, resolver: tx });
            // The slot holder that frees a slot drives this job to completion
            // and sends its result here; we never race the queue ourselves.
            rx.await.unwrap_or(TransferResult {
                success: false,
                transfer_duration_ms: 0,
                target_cache_handle: None,
                error: Some("transfer manager dropped the pending job".to_string()),
            })
        }
    }

    fn try_reserve_slot(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_concurrent).then_some(active + 1)
            })
            .is_ok()
    }

    /// Run a job whose slot is already reserved, then release it and drain
    /// as many pending jobs as the freed slots allow.
    async fn run_reserved(self: &Arc<Self>, job: TransferJob) -> TransferResult {
        let result = self.do_transfer(&job).await;
        self.release_and_drain();
        result
    }

    fn release_and_drain(self: &Arc<Self>) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let Some(next) = self.pending.lock().pop_front() else {
            return;
        };
        // We just freed exactly one slot; reserve it for `next` before
        // spawning so a third caller can't steal it out of FIFO order.
        self.active.fetch_add(1, Ordering::AcqRel);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.do_transfer(&next.job).await;
            manager.release_and_drain();
            let _ = next.resolver.send(result);
        });
    }

    /// Export from source, then import into target, bounded by a single deadline.
    async fn do_transfer(&self, job: &TransferJob) -> TransferResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.export_then_import(job)).await;

        let transfer_duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(cache_handle)) => TransferResult {
                success: true,
                transfer_duration_ms,
                target_cache_handle: Some(cache_handle),
                error: None,
            },
            Ok(Err(e)) => TransferResult {
                success: false,
                transfer_duration_ms,
                target_cache_handle: None,
                error: Some(e.to_string()),
            },
            Err(_) => TransferResult {
                success: false,
                transfer_duration_ms,
                target_cache_handle: None,
                error: Some(format!(
                    "transfer exceeded deadline of {}ms",
                    self.timeout.as_millis()
                )),
            },
        }
    }

    async fn export_then_import(
        &self,
        job: &TransferJob,
    ) -> Result<String, crate::error::ClientError> {
        let exported = self
            .client
            .export_kv_cache(&job.source, &job.source_cache_handle)
            .await?;
        let imported = self
            .client
            .import_kv_cache(&job.target, &exported.transfer_token, &job.source.endpoint)
            .await?;
        Ok(imported.cache_handle)
    }
}
