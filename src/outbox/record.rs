use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::OutboxEvent;

/// An outbox record that has not been stored yet.
///
/// The only way to build one is [`NewOutboxRecord::create`], which stamps
/// `inserted_at` and starts with no delivered listeners. The store assigns
/// the id on insert.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NewOutboxRecord {
    event_name: String,
    event_payload: Value,
    inserted_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
    ready_to_retry_after: Option<DateTime<Utc>>,
}

impl NewOutboxRecord {
    pub fn create(
        event_name: impl Into<String>,
        event_payload: Value,
        expire_at: DateTime<Utc>,
        ready_to_retry_after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            event_payload,
            inserted_at: Utc::now(),
            expire_at,
            ready_to_retry_after,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_payload(&self) -> &Value {
        &self.event_payload
    }

    pub fn inserted_at(&self) -> DateTime<Utc> {
        self.inserted_at
    }

    pub fn expire_at(&self) -> DateTime<Utc> {
        self.expire_at
    }

    pub fn ready_to_retry_after(&self) -> Option<DateTime<Utc>> {
        self.ready_to_retry_after
    }

    /// Attach the store-assigned id.
    pub fn into_record(self, id: u64) -> OutboxRecord {
        OutboxRecord {
            id,
            event_name: self.event_name,
            event_payload: self.event_payload,
            inserted_at: self.inserted_at,
            expire_at: self.expire_at,
            ready_to_retry_after: self.ready_to_retry_after,
            delivered_to_listeners: Vec::new(),
            claimed_by: None,
            claimed_until: None,
        }
    }
}

/// Durable event awaiting (or undergoing) delivery to its listeners.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OutboxRecord {
    pub id: u64,
    pub event_name: String,
    pub event_payload: Value,
    pub inserted_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub ready_to_retry_after: Option<DateTime<Utc>>,
    pub delivered_to_listeners: Vec<String>,
    /// Flusher currently holding the record.
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Eligible for a delivery attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.ready_to_retry_after.map_or(true, |at| at <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }

    /// Held by a flusher whose lease has not run out.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    pub fn has_delivered(&self, listener: &str) -> bool {
        self.delivered_to_listeners.iter().any(|name| name == listener)
    }

    pub fn is_fully_delivered<'a, I>(&self, configured: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        configured.into_iter().all(|name| self.has_delivered(name))
    }

    /// Append a listener name unless it is already present.
    pub fn mark_delivered(&mut self, listener: &str) -> bool {
        if self.has_delivered(listener) {
            return false;
        }
        self.delivered_to_listeners.push(listener.to_string());
        true
    }

    /// Rebuild the typed event from the stored payload.
    pub fn decode<E: OutboxEvent>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.event_payload)
    }
}

/// `now + ttl`, saturating at the latest representable instant.
pub(crate) fn after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
