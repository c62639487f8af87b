//! Request data model: priority, sampling params, and the phase DAG.

use serde::{Deserialize, Serialize};

/// Scheduling priority. Lower rank dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// `{high: 0, normal: 1, low: 2}`, used as the primary sort key in dispatch.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Generation parameters forwarded to the decode worker. All optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub stream: Option<bool>,
}

/// Phase in the queued -> prefilling -> transferring -> decoding -> completed DAG.
/// Any non-terminal phase may transition directly to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Prefilling,
    Transferring,
    Decoding,
    Completed,
    Failed,
}

/// What a caller submits to the scheduler.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub model_id: String,
    pub prompt: String,
    pub sampling_params: SamplingParams,
    pub priority: Priority,
    /// Relative to `created_at`; defaults to the scheduler's `defaultRequestTimeoutMs`.
    pub timeout_ms: Option<u64>,
}

/// Full request record as tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub model_id: String,
    pub prompt: String,
    pub sampling_params: SamplingParams,
    pub priority: Priority,
    pub phase: Phase,
    pub created_at: u64,
    pub timeout_ms: u64,
    pub prefill_worker_id: Option<String>,
    pub decode_worker_id: Option<String>,
    pub kv_cache_handle: Option<String>,
}

/// Result handed back to the caller when a request completes successfully.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: String,
    pub text: String,
    pub completion_tokens: u32,
    pub prefill_latency_ms: u64,
    pub transfer_latency_ms: u64,
    pub decode_latency_ms: u64,
    pub prefill_worker_id: String,
    pub decode_worker_id: String,
}
