use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::duration_ms;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("event `{0}` is configured more than once")]
    DuplicateEvent(String),

    #[error("`{field}` for event `{event_name}` must be greater than zero")]
    NonPositiveTtl {
        event_name: String,
        field: &'static str,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Delivery policy for one event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// How long after creation the record stays eligible for delivery.
    #[serde(rename = "expiresAtTTL", with = "duration_ms")]
    pub expires_at_ttl: Duration,
    /// Delay before the first attempt, and between retries.
    #[serde(
        rename = "readyToRetryAfterTTL",
        default,
        with = "duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ready_to_retry_after_ttl: Option<Duration>,
    /// Upper bound for a single listener invocation.
    #[serde(rename = "maxExecutionTimeTTL", with = "duration_ms")]
    pub max_execution_time_ttl: Duration,
}

impl EventConfig {
    pub fn new(expires_at_ttl: Duration, max_execution_time_ttl: Duration) -> Self {
        Self {
            expires_at_ttl,
            ready_to_retry_after_ttl: None,
            max_execution_time_ttl,
        }
    }

    pub fn with_ready_to_retry_after(mut self, ttl: Duration) -> Self {
        self.ready_to_retry_after_ttl = Some(ttl);
        self
    }

    fn validate(&self, event_name: &str) -> Result<(), ConfigError> {
        let non_positive = |field| ConfigError::NonPositiveTtl {
            event_name: event_name.to_string(),
            field,
        };

        if self.expires_at_ttl.is_zero() {
            return Err(non_positive("expiresAtTTL"));
        }
        if self.max_execution_time_ttl.is_zero() {
            return Err(non_positive("maxExecutionTimeTTL"));
        }
        if self.ready_to_retry_after_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(non_positive("readyToRetryAfterTTL"));
        }
        Ok(())
    }
}

/// A named configuration entry as it appears in the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfigEntry {
    pub name: String,
    pub listeners: EventConfig,
}

/// Immutable event-name to policy lookup.
#[derive(Debug, Clone, Default)]
pub struct EventConfigTable {
    events: HashMap<String, EventConfig>,
}

impl EventConfigTable {
    pub fn from_entries<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = EventConfigEntry>,
    {
        let mut events = HashMap::new();
        for entry in entries {
            entry.listeners.validate(&entry.name)?;
            if events.insert(entry.name.clone(), entry.listeners).is_some() {
                return Err(ConfigError::DuplicateEvent(entry.name));
            }
        }
        Ok(Self { events })
    }

    pub fn get(&self, event_name: &str) -> Option<&EventConfig> {
        self.events.get(event_name)
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.events.contains_key(event_name)
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
