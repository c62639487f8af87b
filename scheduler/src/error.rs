//! Error types surfaced by the scheduling core.
//!
//! Every error a caller can observe from [`crate::Scheduler`] is one of the
//! variants here. Transport-level failures from a [`crate::client::WorkerClient`]
//! are wrapped rather than propagated raw, so the pipeline never has to match
//! on transport-specific error types.

use thiserror::Error;

/// Errors produced by the scheduling core.
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    /// `submit` was rejected because the queue was already at `maxQueueSize`.
    #[error("queue is full ({size}/{max})")]
    QueueFull { size: usize, max: usize },

    /// A queued request aged past its `timeoutMs` before dispatch picked it up.
    #[error("request timed out in queue after {waited_ms}ms")]
    QueueTimeout { waited_ms: u64 },

    /// No decode-role worker was available when the pipeline reached the transfer phase.
    #[error("no decode worker available for model '{model_id}'")]
    NoDecodeWorker { model_id: String },

    /// The prefill worker call failed or returned an unexpected response.
    #[error("prefill failed on worker '{worker_id}': {source}")]
    PrefillFailed {
        worker_id: String,
        #[source]
        source: ClientError,
    },

    /// The decode worker call failed or returned an unexpected response.
    #[error("decode failed on worker '{worker_id}': {source}")]
    DecodeFailed {
        worker_id: String,
        #[source]
        source: ClientError,
    },

    /// The KV cache transfer failed, timed out, or the transport reported an error.
    #[error("kv cache transfer failed: {reason}")]
    TransferFailed { reason: String },
}

impl SchedulerError {
    /// A short, stable tag for the error kind, suitable for event payloads and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "QueueFull",
            Self::QueueTimeout { .. } => "QueueTimeout",
            Self::NoDecodeWorker { .. } => "NoDecodeWorker",
            Self::PrefillFailed { .. } => "PrefillFailed",
            Self::DecodeFailed { .. } => "DecodeFailed",
            Self::TransferFailed { .. } => "TransferFailed",
        }
    }
}

/// Errors internal to a [`crate::client::WorkerClient`] implementation.
///
/// These never escape the client boundary as panics or unexpected error types;
/// `health()` in particular must fold every variant into `{healthy: false}`.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("worker {endpoint} returned HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("unexpected response shape from {endpoint}: {message}")]
    BadResponse { endpoint: String, message: String },

    #[error("call to {endpoint} exceeded its deadline ({timeout_ms}ms)")]
    Timeout { endpoint: String, timeout_ms: u64 },
}
