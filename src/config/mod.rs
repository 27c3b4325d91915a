//! Delivery policy for outbox events.
//!
//! Configuration is supplied once at startup, either in code or as JSON:
//!
//! ```json
//! {
//!   "events": [
//!     {
//!       "name": "UserCreated",
//!       "listeners": {
//!         "expiresAtTTL": 60000,
//!         "readyToRetryAfterTTL": 5000,
//!         "maxExecutionTimeTTL": 10000
//!       }
//!     }
//!   ],
//!   "retryInterval": 5000,
//!   "batchSize": 100
//! }
//! ```
//!
//! All durations are milliseconds.

mod duration_ms;
mod event_config;
mod flusher;

pub use event_config::{ConfigError, EventConfig, EventConfigEntry, EventConfigTable};
pub use flusher::FlusherConfig;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level outbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxConfig {
    pub events: Vec<EventConfigEntry>,
    #[serde(default = "default_retry_interval", with = "duration_ms")]
    pub retry_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_retry_interval() -> Duration {
    FlusherConfig::DEFAULT_RETRY_INTERVAL
}

fn default_batch_size() -> usize {
    FlusherConfig::DEFAULT_BATCH_SIZE
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            retry_interval: default_retry_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl OutboxConfig {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: OutboxConfig = serde_json::from_str(json)?;
        config.table()?;
        Ok(config)
    }

    pub fn with_event(mut self, name: impl Into<String>, config: EventConfig) -> Self {
        self.events.push(EventConfigEntry {
            name: name.into(),
            listeners: config,
        });
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Validate the entries and build the lookup table.
    pub fn table(&self) -> Result<EventConfigTable, ConfigError> {
        EventConfigTable::from_entries(self.events.iter().cloned())
    }

    /// Flusher settings carried by this configuration; the remaining fields
    /// keep their defaults.
    pub fn flusher_config(&self) -> FlusherConfig {
        FlusherConfig::default()
            .with_batch_size(self.batch_size)
            .with_retry_interval(self.retry_interval)
    }
}
