//! HTTP [`WorkerClient`] implementation against the wire contract in the spec:
//! `POST {endpoint}/prefill`, `/decode`, `/kv_cache/export`, `/kv_cache/import`,
//! `GET {endpoint}/health`, with an optional legacy `/completions` fallback.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    DecodeResult, ExportRequest, ExportResponse, HealthResult, ImportRequest, ImportResponse,
    PrefillResult, WorkerClient,
};
use crate::error::ClientError;
use crate::request::SamplingParams;
use crate::worker::Worker;

#[derive(Debug, Deserialize)]
struct PrefillResponse {
    kv_cache_handle: String,
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    text: String,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    gpu_utilization: f64,
    active_requests: usize,
}

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    prompt: String,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    id: String,
    choices: Vec<CompletionsChoice>,
    usage: CompletionsUsage,
}

#[derive(Debug, Deserialize)]
struct CompletionsChoice {
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionsUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Talks to real workers over HTTP. Constructed with a shared [`reqwest::Client`]
/// so connection pooling is amortized across every worker it calls.
pub struct RemoteWorkerClient {
    http: reqwest::Client,
    call_timeout: Duration,
    legacy_fallback: bool,
}

impl RemoteWorkerClient {
    pub fn new(call_timeout: Duration, legacy_fallback: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            call_timeout,
            legacy_fallback,
        }
    }

    async fn post_json<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<R, ClientError> {
        let fut = self.http.post(url).json(body).send();
        let resp = tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| ClientError::Timeout {
                endpoint: url.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            })?
            .map_err(|e| ClientError::Transport {
                endpoint: url.to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ClientError::HttpStatus {
                endpoint: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        resp.json::<R>().await.map_err(|e| ClientError::BadResponse {
            endpoint: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn prefill_via_completions(
        &self,
        worker: &Worker,
        model_id: &str,
        prompt: &str,
    ) -> Result<PrefillResult, ClientError> {
        let url = format!("{}/completions", worker.endpoint);
        let body = CompletionsRequest {
            model: model_id,
            prompt: prompt.to_string(),
            max_tokens: 1,
        };
        let started = Instant::now();
        let resp: CompletionsResponse = self.post_json(&url, &body).await?;
        Ok(PrefillResult {
            kv_cache_handle: resp.id,
            prompt_tokens: resp.usage.prompt_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn decode_via_completions(
        &self,
        worker: &Worker,
        model_id: &str,
        kv_cache_handle: &str,
        sampling_params: &SamplingParams,
    ) -> Result<DecodeResult, ClientError> {
        let url = format!("{}/completions", worker.endpoint);
        let body = CompletionsRequest {
            model: model_id,
            prompt: format!("<kv_cache:{kv_cache_handle}>"),
            max_tokens: sampling_params.max_tokens.unwrap_or(16),
        };
        let started = Instant::now();
        let resp: CompletionsResponse = self.post_json(&url, &body).await?;
        let text = resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default();
        Ok(DecodeResult {
            text,
            completion_tokens: resp.usage.completion_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl WorkerClient for RemoteWorkerClient {
    async fn prefill(
        &self,
        worker: &Worker,
        request_id: &str,
        prompt: &str,
        model_id: &str,
    ) -> Result<PrefillResult, ClientError> {
        let url = format!("{}/prefill", worker.endpoint);
        let body = json!({ "model": model_id, "prompt": prompt, "request_id": request_id });
        let started = Instant::now();

        match self.post_json::<_, PrefillResponse>(&url, &body).await {
            Ok(resp) => Ok(PrefillResult {
                kv_cache_handle: resp.kv_cache_handle,
                prompt_tokens: resp.prompt_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
            }),
            Err(ClientError::HttpStatus { status: 404, .. }) if self.legacy_fallback => {
                self.prefill_via_completions(worker, model_id, prompt).await
            }
            Err(e) => Err(e),
        }
    }

    async fn decode(
        &self,
        worker: &Worker,
        request_id: &str,
        kv_cache_handle: &str,
        model_id: &str,
        sampling_params: &SamplingParams,
    ) -> Result<DecodeResult, ClientError> {
        let url = format!("{}/decode", worker.endpoint);
        let body = json!({
            "model": model_id,
            "kv_cache_handle": kv_cache_handle,
            "request_id": request_id,
            "max_tokens": sampling_params.max_tokens,
            "temperature": sampling_params.temperature,
            "top_p": sampling_params.top_p,
            "top_k": sampling_params.top_k,
            "repetition_penalty": sampling_params.repetition_penalty,
            "stop": sampling_params.stop,
        });
        let started = Instant::now();

        match self.post_json::<_, DecodeResponse>(&url, &body).await {
            Ok(resp) => Ok(DecodeResult {
                text: resp.text,
                completion_tokens: resp.completion_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
            }),
            Err(ClientError::HttpStatus { status: 404, .. }) if self.legacy_fallback => {
                self.decode_via_completions(worker, model_id, kv_cache_handle, sampling_params)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn health(&self, worker: &Worker) -> HealthResult {
        let url = format!("{}/health", worker.endpoint);
        let fut = self.http.get(&url).send();

        let result = async {
            let resp = fut.await.map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            resp.json::<HealthResponse>().await.map_err(|e| e.to_string())
        };

        match tokio::time::timeout(self.call_timeout, result).await {
            Ok(Ok(body)) => HealthResult {
                healthy: body.status == "ok",
                gpu_utilization: body.gpu_utilization,
                active_requests: body.active_requests,
                error: None,
            },
            Ok(Err(message)) => HealthResult {
                healthy: false,
                gpu_utilization: 0.0,
                active_requests: 0,
                error: Some(message),
            },
            Err(_) => HealthResult {
                healthy: false,
                gpu_utilization: 0.0,
                active_requests: 0,
                error: Some("health probe timed out".to_string()),
            },
        }
    }

    async fn export_kv_cache(
        &self,
        worker: &Worker,
        cache_handle: &str,
    ) -> Result<ExportResponse, ClientError> {
        let url = format!("{}/kv_cache/export", worker.endpoint);
        self.post_json(&url, &ExportRequest { cache_handle }).await
    }

    async fn import_kv_cache(
        &self,
        worker: &Worker,
        transfer_token: &str,
        source_worker_endpoint: &str,
    ) -> Result<ImportResponse, ClientError> {
        let url = format!("{}/kv_cache/import", worker.endpoint);
        self.post_json(
            &url,
            &ImportRequest {
                transfer_token,
                source_worker: source_worker_endpoint,
            },
        )
        .await
    }
}
