//! Transactional outbox for Rust services.
//!
//! Business mutations and the events describing them are committed in one
//! store transaction by a [`TransactionalEmitter`]. An [`OutboxFlusher`]
//! later claims due records, runs each registered listener until it has
//! succeeded once, and deletes the record when every listener is done.
//!
//! ```ignore
//! let emitter = TransactionalEmitter::from_config(store, &config)?;
//! emitter.add_listener::<UserCreated, _>("welcome-mail", listener_fn(send_welcome))?;
//!
//! emitter.emit(&UserCreated { user_id }, vec![Mutation::persist(&user)?])?;
//!
//! let report = emitter
//!     .flusher(config.flusher_config())
//!     .process_all_pending_events()
//!     .await?;
//! ```

extern crate self as outbox_rust;

#[cfg(feature = "emitter")]
mod bridge;
mod config;
mod emitter;
mod entity;
mod error;
mod event;
mod flusher;
mod listener;
mod outbox;
mod store;

#[cfg(feature = "emitter")]
pub use bridge::EmitterListener;
pub use config::{
    ConfigError, EventConfig, EventConfigEntry, EventConfigTable, FlusherConfig, OutboxConfig,
};
pub use emitter::{TransactionalEmitter, UnitOfWork};
pub use entity::{Entity, Mutation};
pub use error::{DeliveryFailure, OutboxError, OutboxResult};
pub use event::OutboxEvent;
pub use flusher::{
    FlushReport, FlusherWorker, ListenerAttempt, ListenerOutcome, OutboxFlusher, RecordOutcome,
    RecordStatus, SkipReason, WorkerStats,
};
pub use listener::{
    listener_fn, FnListener, Listener, ListenerError, ListenerRegistry, RegisteredListener,
};
pub use outbox::{NewOutboxRecord, OutboxRecord};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use store::{EntityStoreExt, InMemoryStore, OutboxStore, StoreError, StoreResult};

pub use outbox_rust_macros::{Entity, OutboxEvent};

pub use async_trait::async_trait;

// Re-exported so callers can use the same emitter as `EmitterListener`.
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
