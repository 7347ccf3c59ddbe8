//! Queue configuration
//!
//! `QueueConfig` describes one logical queue. `QueueSet` is the validated,
//! read-only collection shared by the retry manager and the supervisor.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Delay before a retried message re-enters the instant path.
pub const DEFAULT_DELAY_MS: u64 = 2000;

/// Configuration for one logical queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Base name; the instant, delay and dlq paths derive from it
    pub queue_name: String,

    /// Maximum retry attempts before a message is dead-lettered
    #[serde(default)]
    pub retry_count: u32,

    /// Per-message expiration on the delay path, in milliseconds
    #[serde(default = "default_delay_ms", alias = "delay_expiration_ms")]
    pub delay_ms: u64,

    /// Parallel workers for this queue's consumer
    #[serde(default = "one")]
    pub worker_count: usize,

    /// Unacknowledged deliveries allowed in flight
    #[serde(default = "one")]
    pub prefetch_count: usize,
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn one() -> usize {
    1
}

impl QueueConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            retry_count: 0,
            delay_ms: DEFAULT_DELAY_MS,
            worker_count: 1,
            prefetch_count: 1,
        }
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_prefetch_count(mut self, count: usize) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Worker count, never below one.
    pub fn workers(&self) -> usize {
        self.worker_count.max(1)
    }

    /// Prefetch limit, never below one.
    pub fn prefetch(&self) -> usize {
        self.prefetch_count.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Validated queue configurations keyed by queue name.
#[derive(Debug, Clone, Default)]
pub struct QueueSet {
    queues: BTreeMap<String, Arc<QueueConfig>>,
}

impl QueueSet {
    /// Build a set, rejecting empty and duplicate queue names.
    pub fn new(configs: impl IntoIterator<Item = QueueConfig>) -> Result<Self, ConfigError> {
        let mut queues = BTreeMap::new();
        for config in configs {
            if config.queue_name.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName);
            }
            if queues.contains_key(&config.queue_name) {
                return Err(ConfigError::DuplicateQueue(config.queue_name));
            }
            queues.insert(config.queue_name.clone(), Arc::new(config));
        }
        Ok(Self { queues })
    }

    /// Parse a JSON array of queue configurations.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let configs: Vec<QueueConfig> =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::new(configs)
    }

    pub fn get(&self, queue: &str) -> Result<&Arc<QueueConfig>, ConfigError> {
        self.queues
            .get(queue)
            .ok_or_else(|| ConfigError::UnknownQueue(queue.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<QueueConfig>> {
        self.queues.values()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
