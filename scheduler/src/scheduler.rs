//! The scheduling core: queue admission, the dispatch tick, and the
//! prefill -> transfer -> decode pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::WorkerClient;
use crate::config::Config;
use crate::error::SchedulerError;
use crate::events::{now_ms, Event};
use crate::health::HealthMonitor;
use crate::metrics::SchedulerMetrics;
use crate::pool::{SelectionStrategy, WorkerPool};
use crate::request::{Phase, Request, RequestOutcome, RequestSpec};
use crate::transfer::{KVTransferManager, TransferJob};
use crate::worker::{Worker, WorkerRole, WorkerSeed};

/// Interval between dispatch ticks; each tick advances the queue by at most
/// one request.
const DISPATCH_TICK_MS: u64 = 50;

pub type SubmitResult = oneshot::Receiver<Result<RequestOutcome, SchedulerError>>;

/// Owns the queue, the in-flight resolver table, and drives the dispatch
/// and health ticks. Construct with [`Scheduler::new`] and wrap in an
/// `Arc` before calling [`Scheduler::start`].
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    client: Arc<dyn WorkerClient>,
    transfer_manager: Arc<KVTransferManager>,
    health: Arc<HealthMonitor>,
    queue: Mutex<VecDeque<Request>>,
    resolvers: DashMap<String, oneshot::Sender<Result<RequestOutcome, SchedulerError>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    active_prefills: AtomicUsize,
    active_transfers: AtomicUsize,
    active_decodes: AtomicUsize,
    strategy: SelectionStrategy,
    max_queue_size: usize,
    default_request_timeout_ms: u64,
    health_check_interval_ms: u64,
    worker_timeout_ms: u64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: Config, client: Arc<dyn WorkerClient>) -> Arc<Self> {
        let pool = Arc::new(WorkerPool::new());
        for seed in &config.workers {
            pool.register(WorkerSeed {
                id: seed.id.clone(),
                endpoint: seed.endpoint.clone(),
                role: seed.role,
                model_id: seed.model_id.clone(),
                max_concurrency: seed.max_concurrency,
            });
        }

        let transfer_manager = Arc::new(KVTransferManager::new(
            Arc::clone(&client),
            config.kv_transfer.max_concurrent,
            Duration::from_millis(config.kv_transfer.timeout_ms),
        ));

        Arc::new(Self {
            pool,
            client,
            transfer_manager,
            health: Arc::new(HealthMonitor::new()),
            queue: Mutex::new(VecDeque::new()),
            resolvers: DashMap::new(),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            active_prefills: AtomicUsize::new(0),
            active_transfers: AtomicUsize::new(0),
            active_decodes: AtomicUsize::new(0),
            strategy: config.strategy,
            max_queue_size: config.max_queue_size,
            default_request_timeout_ms: config.default_request_timeout_ms,
            health_check_interval_ms: config.health_check_interval_ms,
            worker_timeout_ms: config.worker_timeout_ms,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Register a worker and emit `worker_online` for it.
    pub fn register_worker(&self, seed: WorkerSeed) -> Worker {
        let role_label = match seed.role {
            WorkerRole::Prefill => "prefill",
            WorkerRole::Decode => "decode",
        };
        let worker = self.pool.register(seed);
        info!(worker_id = %worker.id, role = role_label, "worker online");
        self.health.events().emit(Event::WorkerOnline {
            worker_id: worker.id.clone(),
            role: role_label.to_string(),
            timestamp: now_ms(),
        });
        worker
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.health.snapshot(
            &self.pool,
            self.queue.lock().len(),
            self.active_prefills.load(Ordering::Relaxed),
            self.active_transfers.load(Ordering::Relaxed),
            self.active_decodes.load(Ordering::Relaxed),
        )
    }

    pub fn events(&self, limit: usize) -> Vec<Event> {
        self.health.events().recent(limit)
    }

    /// Admit a request. Rejects synchronously with [`SchedulerError::QueueFull`]
    /// when the queue is already at capacity; otherwise returns the generated
    /// request id alongside a receiver that resolves exactly once, when the
    /// pipeline settles.
    pub fn submit(&self, spec: RequestSpec) -> Result<(String, SubmitResult), SchedulerError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue_size {
            return Err(SchedulerError::QueueFull {
                size: queue.len(),
                max: self.max_queue_size,
            });
        }

        let request_id = format!("req-{}", Uuid::new_v4());
        let request = Request {
            request_id: request_id.clone(),
            model_id: spec.model_id,
            prompt: spec.prompt,
            sampling_params: spec.sampling_params,
            priority: spec.priority,
            phase: Phase::Queued,
            created_at: now_ms(),
            timeout_ms: spec.timeout_ms.unwrap_or(self.default_request_timeout_ms),
            prefill_worker_id: None,
            decode_worker_id: None,
            kv_cache_handle: None,
        };

        let (tx, rx) = oneshot::channel();
        self.resolvers.insert(request_id.clone(), tx);
        queue.push_back(request);
        drop(queue);

        self.health.events().emit(Event::RequestQueued {
            request_id: request_id.clone(),
            timestamp: now_ms(),
        });
        Ok((request_id, rx))
    }

    /// Start the dispatch and health ticks. A no-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let dispatch_self = Arc::clone(self);
        let dispatch_token = token.clone();
        let dispatch_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(DISPATCH_TICK_MS));
            loop {
                tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    _ = ticker.tick() => dispatch_self.dispatch_tick().await,
                }
            }
        });

        let health_self = Arc::clone(self);
        let health_token = token.clone();
        let health_interval_ms = self.health_check_interval_ms.max(1);
        let worker_timeout_ms = self.worker_timeout_ms;
        let health_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(health_interval_ms));
            loop {
                tokio::select! {
                    _ = health_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = health_self
                            .health
                            .tick(&health_self.pool, &health_self.client, worker_timeout_ms);
                        tokio::select! {
                            _ = health_token.cancelled() => break,
                            _ = tick => {}
                        }
                    }
                }
            }
        });

        *self.tasks.lock() = vec![dispatch_handle, health_handle];
        info!("scheduler started");
    }

    /// Cancel the dispatch and health ticks and wait for both tasks to exit.
    /// An in-flight health probe is aborted rather than awaited, so this
    /// returns promptly even if a worker is unresponsive. In-flight
    /// pipelines are spawned independently and keep running to completion.
    /// A no-op if already stopped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.lock().cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }

    /// Run one dispatch tick: sort, sweep expired entries, and launch at
    /// most one request into the pipeline.
    async fn dispatch_tick(self: &Arc<Self>) {
        let now = now_ms();
        let mut expired = Vec::new();
        {
            let mut queue = self.queue.lock();
            let mut items: Vec<Request> = queue.drain(..).collect();
            items.sort_by(|a, b| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then(a.created_at.cmp(&b.created_at))
            });

            let mut kept = Vec::with_capacity(items.len());
            for req in items.into_iter().rev() {
                let waited_ms = now.saturating_sub(req.created_at);
                if waited_ms > req.timeout_ms {
                    expired.push((req.request_id.clone(), waited_ms));
                } else {
                    kept.push(req);
                }
            }
            kept.reverse();
            *queue = kept.into();
        }

        for (request_id, waited_ms) in expired {
            warn!(%request_id, waited_ms, "request timed out waiting in queue");
            self.fail(&request_id, SchedulerError::QueueTimeout { waited_ms });
        }

        let Some(prefill_worker) = self.pool.select(WorkerRole::Prefill, self.strategy) else {
            return;
        };
        let next = self.queue.lock().pop_front();
        let Some(request) = next else {
            return;
        };

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_pipeline(request, prefill_worker).await;
        });
    }

    /// Fail an in-flight or queued request. A no-op if `request_id` is
    /// unknown (already settled).
    fn fail(&self, request_id: &str, err: SchedulerError) {
        warn!(request_id, error = %err, "request failed");
        self.health.record_failure();
        self.health.events().emit(Event::RequestFailed {
            request_id: request_id.to_string(),
            error: err.to_string(),
            timestamp: now_ms(),
        });
        if let Some((_, resolver)) = self.resolvers.remove(request_id) {
            let _ = resolver.send(Err(err));
        }
    }

    async fn run_pipeline(self: Arc<Self>, mut request: Request, prefill_worker: Worker) {
        let request_id = request.request_id.clone();

        request.phase = Phase::Prefilling;
        request.prefill_worker_id = Some(prefill_worker.id.clone());
        self.pool.increment_active(&prefill_worker.id);
        self.active_prefills.fetch_add(1, Ordering::Relaxed);
        info!(request_id = %request_id, worker_id = %prefill_worker.id, "prefill started");
        self.health.events().emit(Event::PrefillStarted {
            request_id: request_id.clone(),
            worker_id: prefill_worker.id.clone(),
            timestamp: now_ms(),
        });

        let prefill_result = self
            .client
            .prefill(&prefill_worker, &request_id, &request.prompt, &request.model_id)
            .await;
        self.pool.decrement_active(&prefill_worker.id);
        self.active_prefills.fetch_sub(1, Ordering::Relaxed);

        let prefill = match prefill_result {
            Ok(r) => r,
            Err(source) => {
                self.fail(
                    &request_id,
                    SchedulerError::PrefillFailed {
                        worker_id: prefill_worker.id.clone(),
                        source,
                    },
                );
                return;
            }
        };
        info!(
            request_id = %request_id,
            worker_id = %prefill_worker.id,
            latency_ms = prefill.latency_ms,
            "prefill completed"
        );
        self.health.events().emit(Event::PrefillCompleted {
            request_id: request_id.clone(),
            worker_id: prefill_worker.id.clone(),
            latency_ms: prefill.latency_ms,
            timestamp: now_ms(),
        });
        request.kv_cache_handle = Some(prefill.kv_cache_handle.clone());

        request.phase = Phase::Transferring;
        let Some(decode_worker) = self.pool.select(WorkerRole::Decode, self.strategy) else {
            self.fail(
                &request_id,
                SchedulerError::NoDecodeWorker {
                    model_id: request.model_id.clone(),
                },
            );
            return;
        };
        request.decode_worker_id = Some(decode_worker.id.clone());
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %request_id,
            from = %prefill_worker.endpoint,
            to = %decode_worker.endpoint,
            "kv cache transfer started"
        );
        self.health.events().emit(Event::TransferStarted {
            request_id: request_id.clone(),
            from: prefill_worker.endpoint.clone(),
            to: decode_worker.endpoint.clone(),
            timestamp: now_ms(),
        });

        let transfer_result = self
            .transfer_manager
            .transfer(TransferJob {
                request_id: request_id.clone(),
                source: prefill_worker.clone(),
                target: decode_worker.clone(),
                source_cache_handle: prefill.kv_cache_handle.clone(),
            })
            .await;
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);

        if !transfer_result.success {
            self.fail(
                &request_id,
                SchedulerError::TransferFailed {
                    reason: transfer_result
                        .error
                        .unwrap_or_else(|| "transfer failed with no further detail".to_string()),
                },
            );
            return;
        }
        info!(
            request_id = %request_id,
            duration_ms = transfer_result.transfer_duration_ms,
            "kv cache transfer completed"
        );
        self.health.events().emit(Event::TransferCompleted {
            request_id: request_id.clone(),
            duration_ms: transfer_result.transfer_duration_ms,
            timestamp: now_ms(),
        });
        let target_handle = transfer_result
            .target_cache_handle
            .unwrap_or_else(|| prefill.kv_cache_handle.clone());

        request.phase = Phase::Decoding;
        self.pool.increment_active(&decode_worker.id);
        self.active_decodes.fetch_add(1, Ordering::Relaxed);
        info!(request_id = %request_id, worker_id = %decode_worker.id, "decode started");
        self.health.events().emit(Event::DecodeStarted {
            request_id: request_id.clone(),
            worker_id: decode_worker.id.clone(),
            timestamp: now_ms(),
        });

        let decode_result = self
            .client
            .decode(
                &decode_worker,
                &request_id,
                &target_handle,
                &request.model_id,
                &request.sampling_params,
            )
            .await;
        self.pool.decrement_active(&decode_worker.id);
        self.active_decodes.fetch_sub(1, Ordering::Relaxed);

        let decode = match decode_result {
            Ok(r) => r,
            Err(source) => {
                self.fail(
                    &request_id,
                    SchedulerError::DecodeFailed {
                        worker_id: decode_worker.id.clone(),
                        source,
                    },
                );
                return;
            }
        };
        info!(
            request_id = %request_id,
            worker_id = %decode_worker.id,
            latency_ms = decode.latency_ms,
            "decode completed"
        );
        self.health.events().emit(Event::DecodeCompleted {
            request_id: request_id.clone(),
            worker_id: decode_worker.id.clone(),
            latency_ms: decode.latency_ms,
            timestamp: now_ms(),
        });

        let total_latency_ms =
            prefill.latency_ms + transfer_result.transfer_duration_ms + decode.latency_ms;
        self.health
            .record_completion(total_latency_ms, prefill.latency_ms, decode.latency_ms);
        info!(request_id = %request_id, total_latency_ms, "request completed");
        self.health.events().emit(Event::RequestCompleted {
            request_id: request_id.clone(),
            total_latency_ms,
            timestamp: now_ms(),
        });

        if let Some((_, resolver)) = self.resolvers.remove(&request_id) {
            let _ = resolver.send(Ok(RequestOutcome {
                request_id: request_id.clone(),
                text: decode.text,
                completion_tokens: decode.completion_tokens,
                prefill_latency_ms: prefill.latency_ms,
                transfer_latency_ms: transfer_result.transfer_duration_ms,
                decode_latency_ms: decode.latency_ms,
                prefill_worker_id: prefill_worker.id.clone(),
                decode_worker_id: decode_worker.id.clone(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, SamplingParams};
    use crate::testing::MockWorkerClient;
    use crate::worker::WorkerStatus;
    use std::time::Duration as StdDuration;

    fn spec(priority: Priority) -> RequestSpec {
        RequestSpec {
            model_id: "M".to_string(),
            prompt: "hi".to_string(),
            sampling_params: SamplingParams::default(),
            priority,
            timeout_ms: None,
        }
    }

    fn config(max_queue_size: usize) -> Config {
        Config {
            max_queue_size,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn happy_path_completes_with_expected_text_and_metrics() {
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Scheduler::new(config(10), client);
        scheduler.register_worker(WorkerSeed {
            id: "p1".to_string(),
            endpoint: "http://p1".to_string(),
            role: WorkerRole::Prefill,
            model_id: "M".to_string(),
            max_concurrency: Some(8),
        });
        scheduler.register_worker(WorkerSeed {
            id: "d1".to_string(),
            endpoint: "http://d1".to_string(),
            role: WorkerRole::Decode,
            model_id: "M".to_string(),
            max_concurrency: Some(8),
        });

        scheduler.start();
        let (_, rx) = scheduler.submit(spec(Priority::Normal)).unwrap();
        let outcome = tokio::time::timeout(StdDuration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        scheduler.stop().await;

        assert_eq!(outcome.text, "ok");
        let metrics = scheduler.metrics();
        assert_eq!(metrics.total_completed, 1);
        assert_eq!(metrics.total_failed, 0);

        let kinds: Vec<&'static str> = scheduler
            .events(50)
            .iter()
            .map(|e| match e {
                Event::RequestQueued { .. } => "request_queued",
                Event::PrefillStarted { .. } => "prefill_started",
                Event::PrefillCompleted { .. } => "prefill_completed",
                Event::TransferStarted { .. } => "transfer_started",
                Event::TransferCompleted { .. } => "transfer_completed",
                Event::DecodeStarted { .. } => "decode_started",
                Event::DecodeCompleted { .. } => "decode_completed",
                Event::RequestCompleted { .. } => "request_completed",
                Event::RequestFailed { .. } => "request_failed",
                Event::WorkerOnline { .. } => "worker_online",
                Event::WorkerOffline { .. } => "worker_offline",
            })
            .filter(|k| *k != "worker_online")
            .collect();
        assert_eq!(
            kinds,
            vec![
                "request_queued",
                "prefill_started",
                "prefill_completed",
                "transfer_started",
                "transfer_completed",
                "decode_started",
                "decode_completed",
                "request_completed",
            ]
        );
    }

    #[tokio::test]
    async fn zero_size_queue_rejects_every_submit() {
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Scheduler::new(config(0), client);
        let err = scheduler.submit(spec(Priority::Normal)).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { size: 0, max: 0 }));
        assert_eq!(scheduler.metrics().total_completed, 0);
    }

    #[tokio::test]
    async fn priority_ordering_dispatches_high_before_normal_before_low() {
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Scheduler::new(config(10), client);

        let (id_low, rx_low) = scheduler.submit(spec(Priority::Low)).unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let (id_normal, rx_normal) = scheduler.submit(spec(Priority::Normal)).unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let (id_high, rx_high) = scheduler.submit(spec(Priority::High)).unwrap();

        scheduler.register_worker(WorkerSeed {
            id: "p1".to_string(),
            endpoint: "http://p1".to_string(),
            role: WorkerRole::Prefill,
            model_id: "M".to_string(),
            max_concurrency: Some(1),
        });
        scheduler.register_worker(WorkerSeed {
            id: "d1".to_string(),
            endpoint: "http://d1".to_string(),
            role: WorkerRole::Decode,
            model_id: "M".to_string(),
            max_concurrency: Some(1),
        });
        scheduler.start();

        let mut order = Vec::new();
        for (rx, name) in [(rx_high, "high"), (rx_normal, "normal"), (rx_low, "low")] {
            tokio::time::timeout(StdDuration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            order.push(name);
        }
        scheduler.stop().await;

        let prefill_started: Vec<String> = scheduler
            .events(50)
            .into_iter()
            .filter_map(|e| match e {
                Event::PrefillStarted { request_id, .. } => Some(request_id),
                _ => None,
            })
            .collect();
        // Submitted low, normal, high (in that order) but dispatched high first.
        assert_eq!(prefill_started, vec![id_high, id_normal, id_low]);
    }

    #[tokio::test]
    async fn queue_timeout_fails_request_before_any_prefill_worker_is_available() {
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Scheduler::new(config(10), client);
        scheduler.start();

        let mut s = spec(Priority::Normal);
        s.timeout_ms = Some(10);
        let (_, rx) = scheduler.submit(s).unwrap();

        let err = tokio::time::timeout(StdDuration::from_millis(500), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        scheduler.stop().await;

        assert!(matches!(err, SchedulerError::QueueTimeout { .. }));
        assert!(scheduler
            .events(50)
            .iter()
            .all(|e| !matches!(e, Event::PrefillStarted { .. })));
    }

    #[tokio::test]
    async fn stale_worker_is_evicted_and_excluded_from_available() {
        let client = Arc::new(MockWorkerClient::new());
        client.set_unhealthy();
        let scheduler = Scheduler::new(config(10), client);
        let worker = scheduler.register_worker(WorkerSeed {
            id: "p1".to_string(),
            endpoint: "http://p1".to_string(),
            role: WorkerRole::Prefill,
            model_id: "M".to_string(),
            max_concurrency: Some(1),
        });
        assert_eq!(worker.status, WorkerStatus::Idle);

        scheduler
            .health
            .tick(&scheduler.pool, &scheduler.client, 10)
            .await;

        assert!(scheduler.pool.available(WorkerRole::Prefill).is_empty());
        assert!(scheduler
            .events(50)
            .iter()
            .any(|e| matches!(e, Event::WorkerOffline { worker_id, .. } if worker_id == "p1")));
    }
}
