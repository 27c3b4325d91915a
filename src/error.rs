use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::listener::ListenerError;
use crate::store::StoreError;

/// Errors surfaced to callers of the emitter and the flusher.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The event name has no entry in the configuration table.
    #[error("no configuration registered for event `{event_name}`")]
    UnknownEvent { event_name: String },

    /// A listener with the same name is already registered for the event.
    #[error("listener `{listener}` is already registered for event `{event_name}`")]
    DuplicateListener { event_name: String, listener: String },

    #[error("invalid outbox configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("outbox storage failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize outbox payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a single listener invocation did not succeed.
///
/// Delivery failures stay scoped to one record/listener pair and are
/// reported through [`FlushReport`](crate::FlushReport), never returned.
#[derive(Debug, Error)]
pub enum DeliveryFailure {
    #[error("listener failed: {0}")]
    Handler(ListenerError),

    #[error("listener exceeded its execution time of {0:?}")]
    TimedOut(Duration),

    #[error("listener panicked: {0}")]
    Panicked(String),

    #[error("stored payload does not match the event shape: {0}")]
    Decode(serde_json::Error),
}

pub type OutboxResult<T> = Result<T, OutboxError>;
