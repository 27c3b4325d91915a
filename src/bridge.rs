//! Forward delivered outbox events to an in-process [`EventEmitter`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use event_emitter_rs::EventEmitter;

use crate::event::OutboxEvent;
use crate::listener::{Listener, ListenerError};

/// A listener that re-emits each event on an [`EventEmitter`] under its
/// event name, with the JSON payload as a `String`.
///
/// Subscribers run on the emitter's own threads, so a successful delivery
/// only means the event was handed over.
#[derive(Clone)]
pub struct EmitterListener {
    emitter: Arc<Mutex<EventEmitter>>,
}

impl EmitterListener {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            emitter: Arc::new(Mutex::new(emitter)),
        }
    }

    pub fn shared(emitter: Arc<Mutex<EventEmitter>>) -> Self {
        Self { emitter }
    }

    pub fn emitter(&self) -> &Arc<Mutex<EventEmitter>> {
        &self.emitter
    }
}

#[async_trait]
impl<E: OutboxEvent> Listener<E> for EmitterListener {
    async fn handle(&self, event: E) -> Result<(), ListenerError> {
        let payload = serde_json::to_string(&event)?;
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| ListenerError::from("event emitter lock poisoned"))?;
        emitter.emit(event.event_name(), payload);
        Ok(())
    }
}
