//! Scheduler configuration, deserializable from TOML, with defaults matching
//! the documented production values.

use serde::{Deserialize, Serialize};

use crate::pool::SelectionStrategy;
use crate::worker::WorkerRole;

fn default_true() -> bool {
    true
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_worker_timeout_ms() -> u64 {
    30_000
}

fn default_max_queue_size() -> usize {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_kv_transfer_max_concurrent() -> usize {
    4
}

fn default_kv_transfer_timeout_ms() -> u64 {
    15_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

/// Seed entry for a worker known at startup; more can be registered later
/// through `Scheduler::worker_pool()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub endpoint: String,
    pub role: WorkerRole,
    pub model_id: String,
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvTransferConfig {
    #[serde(default = "default_kv_transfer_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_kv_transfer_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for KvTransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_kv_transfer_max_concurrent(),
            timeout_ms: default_kv_transfer_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerClientConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub legacy_fallback: bool,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            legacy_fallback: false,
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub kv_transfer: KvTransferConfig,
    #[serde(default)]
    pub worker_client: WorkerClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: SelectionStrategy::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            worker_timeout_ms: default_worker_timeout_ms(),
            max_queue_size: default_max_queue_size(),
            default_request_timeout_ms: default_request_timeout_ms(),
            workers: Vec::new(),
            kv_transfer: KvTransferConfig::default(),
            worker_client: WorkerClientConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document into a `Config`, falling back to documented
    /// defaults for any field left unset.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_documented_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.health_check_interval_ms, 10_000);
        assert_eq!(cfg.worker_timeout_ms, 30_000);
        assert_eq!(cfg.max_queue_size, 1_000);
        assert_eq!(cfg.kv_transfer.max_concurrent, 4);
        assert_eq!(cfg.kv_transfer.timeout_ms, 15_000);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let cfg = Config::from_toml("max_queue_size = 5\nstrategy = \"least-loaded\"").unwrap();
        assert_eq!(cfg.max_queue_size, 5);
        assert_eq!(cfg.strategy, SelectionStrategy::LeastLoaded);
        assert_eq!(cfg.worker_timeout_ms, 30_000);
    }
}
