//! Event, the unit of work handed to handlers
//!
//! An event is immutable once built. Components that need to change it (the
//! retry manager bumping its counter, for example) build a new value from the
//! old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the number of retries already spent on an event.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message decoded from a stream or queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    key: Vec<u8>,
    value: Vec<u8>,
    #[serde(default)]
    headers: HashMap<String, String>,
    routing_path: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        routing_path: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: HashMap::new(),
            routing_path: routing_path.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn routing_path(&self) -> &str {
        &self.routing_path
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Retries already spent on this event.
    ///
    /// A missing or unparsable header counts as zero.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Copy of this event with the retry counter set to `count`.
    pub fn with_retry_count(self, count: u32) -> Self {
        self.with_header(RETRY_COUNT_HEADER, count.to_string())
    }

    /// Copy of this event without a retry counter.
    pub fn without_retry_count(mut self) -> Self {
        self.headers.remove(RETRY_COUNT_HEADER);
        self
    }

    /// How long ago the event was produced.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}
