//! A programmable [`WorkerClient`] stub used by unit and scenario tests.
//!
//! Every call succeeds quickly with deterministic output by default; tests
//! flip individual knobs (delay, failure, response payload) to exercise the
//! scheduler's handling of slow or faulty workers without a real network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    DecodeResult, ExportResponse, HealthResult, ImportResponse, PrefillResult, WorkerClient,
};
use crate::error::ClientError;
use crate::request::SamplingParams;
use crate::worker::Worker;

pub struct MockWorkerClient {
    prefill_delay: Mutex<Duration>,
    decode_delay: Mutex<Duration>,
    transfer_delay: Mutex<Duration>,
    prefill_tokens: AtomicU64,
    decode_tokens: AtomicU64,
    decode_text: Mutex<String>,
    fail_prefill: AtomicBool,
    fail_decode: AtomicBool,
    fail_transfers: AtomicBool,
    healthy: AtomicBool,
    gpu_utilization: Mutex<f64>,
    active_requests: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl Default for MockWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkerClient {
    pub fn new() -> Self {
        Self {
            prefill_delay: Mutex::new(Duration::ZERO),
            decode_delay: Mutex::new(Duration::ZERO),
            transfer_delay: Mutex::new(Duration::ZERO),
            prefill_tokens: AtomicU64::new(2),
            decode_tokens: AtomicU64::new(4),
            decode_text: Mutex::new("ok".to_string()),
            fail_prefill: AtomicBool::new(false),
            fail_decode: AtomicBool::new(false),
            fail_transfers: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            gpu_utilization: Mutex::new(0.1),
            active_requests: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_prefill_delay(&self, delay: Duration) {
        *self.prefill_delay.lock() = delay;
    }

    pub fn set_decode_delay(&self, delay: Duration) {
        *self.decode_delay.lock() = delay;
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        *self.transfer_delay.lock() = delay;
    }

    pub fn set_decode_response(&self, text: &str, tokens: u64) {
        *self.decode_text.lock() = text.to_string();
        self.decode_tokens.store(tokens, Ordering::Relaxed);
    }

    pub fn fail_prefill(&self) {
        self.fail_prefill.store(true, Ordering::Relaxed);
    }

    pub fn fail_decode(&self) {
        self.fail_decode.store(true, Ordering::Relaxed);
    }

    pub fn fail_transfers(&self) {
        self.fail_transfers.store(true, Ordering::Relaxed);
    }

    pub fn set_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Request ids observed by `transfer_completed` order, in call order —
    /// used to assert FIFO ordering under back-pressure.
    pub fn completed_transfer_order(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn prefill(
        &self,
        _worker: &Worker,
        _request_id: &str,
        _prompt: &str,
        _model_id: &str,
    ) -> Result<PrefillResult, ClientError> {
        let delay = *self.prefill_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_prefill.load(Ordering::Relaxed) {
            return Err(ClientError::Transport {
                endpoint: _worker.endpoint.clone(),
                message: "simulated prefill failure".to_string(),
            });
        }
        Ok(PrefillResult {
            kv_cache_handle: "h1".to_string(),
            prompt_tokens: self.prefill_tokens.load(Ordering::Relaxed) as u32,
            latency_ms: delay.as_millis() as u64,
        })
    }

    async fn decode(
        &self,
        worker: &Worker,
        _request_id: &str,
        _kv_cache_handle: &str,
        _model_id: &str,
        _sampling_params: &SamplingParams,
    ) -> Result<DecodeResult, ClientError> {
        let delay = *self.decode_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_decode.load(Ordering::Relaxed) {
            return Err(ClientError::Transport {
                endpoint: worker.endpoint.clone(),
                message: "simulated decode failure".to_string(),
            });
        }
        Ok(DecodeResult {
            text: self.decode_text.lock().clone(),
            completion_tokens: self.decode_tokens.load(Ordering::Relaxed) as u32,
            latency_ms: delay.as_millis() as u64,
        })
    }

    async fn health(&self, _worker: &Worker) -> HealthResult {
        if self.healthy.load(Ordering::Relaxed) {
            HealthResult {
                healthy: true,
                gpu_utilization: *self.gpu_utilization.lock(),
                active_requests: self.active_requests.load(Ordering::Relaxed) as usize,
                error: None,
            }
        } else {
            HealthResult {
                healthy: false,
                gpu_utilization: 0.0,
                active_requests: 0,
                error: Some("simulated unhealthy worker".to_string()),
            }
        }
    }

    async fn export_kv_cache(
        &self,
        worker: &Worker,
        cache_handle: &str,
    ) -> Result<ExportResponse, ClientError> {
        let delay = *self.transfer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_transfers.load(Ordering::Relaxed) {
            return Err(ClientError::Transport {
                endpoint: worker.endpoint.clone(),
                message: "simulated transfer failure".to_string(),
            });
        }
        Ok(ExportResponse {
            transfer_token: format!("tok:{cache_handle}"),
        })
    }

    async fn import_kv_cache(
        &self,
        worker: &Worker,
        transfer_token: &str,
        _source_worker_endpoint: &str,
    ) -> Result<ImportResponse, ClientError> {
        if self.fail_transfers.load(Ordering::Relaxed) {
            return Err(ClientError::Transport {
                endpoint: worker.endpoint.clone(),
                message: "simulated transfer failure".to_string(),
            });
        }
        self.calls.lock().push(transfer_token.to_string());
        Ok(ImportResponse {
            cache_handle: format!("{transfer_token}'"),
        })
    }
}
