//! The narrow contract the scheduling core consumes from a worker.
//!
//! One implementation talks to real vLLM-style workers over HTTP
//! ([`RemoteWorkerClient`]); another is a programmable stub for tests
//! ([`crate::testing::MockWorkerClient`]). The core only ever depends on
//! the [`WorkerClient`] trait object, never on a concrete transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::request::SamplingParams;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct PrefillResult {
    pub kv_cache_handle: String,
    pub prompt_tokens: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub text: String,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HealthResult {
    pub healthy: bool,
    pub gpu_utilization: f64,
    pub active_requests: usize,
    pub error: Option<String>,
}

/// Wire body for `POST {endpoint}/kv_cache/export`.
#[derive(Debug, Serialize)]
pub struct ExportRequest<'a> {
    pub cache_handle: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ExportResponse {
    pub transfer_token: String,
}

/// Wire body for `POST {endpoint}/kv_cache/import`.
#[derive(Debug, Serialize)]
pub struct ImportRequest<'a> {
    pub transfer_token: &'a str,
    pub source_worker: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ImportResponse {
    pub cache_handle: String,
}

/// Narrow contract the scheduling core consumes from a worker.
///
/// `health` must never throw: transport failures are mapped to
/// `{healthy: false, error: Some(..)}` rather than an `Err`.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn prefill(
        &self,
        worker: &Worker,
        request_id: &str,
        prompt: &str,
        model_id: &str,
    ) -> Result<PrefillResult, ClientError>;

    async fn decode(
        &self,
        worker: &Worker,
        request_id: &str,
        kv_cache_handle: &str,
        model_id: &str,
        sampling_params: &SamplingParams,
    ) -> Result<DecodeResult, ClientError>;

    async fn health(&self, worker: &Worker) -> HealthResult;

    /// Export the source-side half of a KV cache transfer.
    async fn export_kv_cache(
        &self,
        worker: &Worker,
        cache_handle: &str,
    ) -> Result<ExportResponse, ClientError>;

    /// Import the target-side half of a KV cache transfer. Per the wire
    /// contract, `source_worker` is the source worker's `endpoint`, not a
    /// freshly invented id — matching existing worker behaviour.
    async fn import_kv_cache(
        &self,
        worker: &Worker,
        transfer_token: &str,
        source_worker_endpoint: &str,
    ) -> Result<ImportResponse, ClientError>;
}

mod remote;
pub use remote::RemoteWorkerClient;
