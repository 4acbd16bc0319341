//! Pipeline configuration.
//!
//! Every value must be present in the TOML file: there are no serde defaults,
//! and unknown keys are rejected. `validate()` catches values that would make
//! the pipeline meaningless (zero shards, zero workers, ...) before any packet
//! is accepted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration errors. Startup aborts on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Decide immediately (displace a lower class or reject)
    Reject,
    /// Wait up to `enqueue_timeout_ms` for space, then decide as `Reject` would
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Concurrent worker loops draining the queue
    pub worker_count: usize,
    /// Queue capacity across all priority lanes
    pub max_queue_size: usize,
    /// Wait time after which a packet's effective priority is bumped one level
    pub aging_threshold_ms: u64,
    /// Transient failures tolerated before a packet is dead-lettered
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Partitions per destination
    pub shard_count: u32,
    /// Max packets bundled into one commit call (1 disables batching)
    pub batch_size: usize,
    pub admission_policy: AdmissionPolicy,
    /// Only consulted under `AdmissionPolicy::Block`
    pub enqueue_timeout_ms: u64,
    /// Concurrent commit calls allowed against the destination store
    pub store_pool_size: usize,
    /// How long shutdown waits for in-flight packets before aborting workers
    pub drain_deadline_ms: u64,
    pub health_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, u64); 8] = [
            ("worker_count", self.worker_count as u64),
            ("max_queue_size", self.max_queue_size as u64),
            ("shard_count", self.shard_count as u64),
            ("batch_size", self.batch_size as u64),
            ("store_pool_size", self.store_pool_size as u64),
            ("aging_threshold_ms", self.aging_threshold_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) must not exceed backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }

        if self.admission_policy == AdmissionPolicy::Block && self.enqueue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "enqueue_timeout_ms must be > 0 when admission_policy = \"block\"".to_string(),
            ));
        }

        Ok(())
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
