use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::{DeliveryFailure, OutboxError};
use crate::event::OutboxEvent;

use super::Listener;

type ErasedHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), DeliveryFailure>> + Send + Sync>;

/// A listener bound to an event name, with its payload type erased.
#[derive(Clone)]
pub struct RegisteredListener {
    name: String,
    handler: ErasedHandler,
}

impl RegisteredListener {
    fn new<E, L>(name: String, listener: L) -> Self
    where
        E: OutboxEvent,
        L: Listener<E>,
    {
        let listener = Arc::new(listener);
        let handler: ErasedHandler = Arc::new(move |payload: Value| {
            let listener = Arc::clone(&listener);
            async move {
                let event: E = serde_json::from_value(payload).map_err(DeliveryFailure::Decode)?;
                listener.handle(event).await.map_err(DeliveryFailure::Handler)
            }
            .boxed()
        });
        Self { name, handler }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode `payload` into the listener's event type and run it.
    pub async fn invoke(&self, payload: Value) -> Result<(), DeliveryFailure> {
        (self.handler)(payload).await
    }
}

impl fmt::Debug for RegisteredListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredListener")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Event name to ordered listeners, unique by name per event.
///
/// The registry lives as long as the emitter that owns it. Cloning yields
/// another handle to the same registrations.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<HashMap<String, Vec<RegisteredListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `E` under `name`. An existing registration
    /// with the same name is left in place and an error is returned.
    pub fn add<E, L>(&self, name: impl Into<String>, listener: L) -> Result<(), OutboxError>
    where
        E: OutboxEvent,
        L: Listener<E>,
    {
        let name = name.into();
        // Lock scopes never run listener code, so a poisoned map is still consistent.
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = listeners.entry(E::EVENT_NAME.to_string()).or_default();

        if registered.iter().any(|existing| existing.name == name) {
            return Err(OutboxError::DuplicateListener {
                event_name: E::EVENT_NAME.to_string(),
                listener: name,
            });
        }

        registered.push(RegisteredListener::new::<E, L>(name, listener));
        Ok(())
    }

    /// Drop every listener for `event_name`, returning how many were removed.
    pub fn remove_all(&self, event_name: &str) -> usize {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_name)
            .map_or(0, |removed| removed.len())
    }

    /// Listeners for `event_name` in registration order.
    pub fn get(&self, event_name: &str) -> Vec<RegisteredListener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn names(&self, event_name: &str) -> Vec<String> {
        self.get(event_name)
            .into_iter()
            .map(|listener| listener.name)
            .collect()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(listeners.iter().map(|(event, registered)| {
                let names: Vec<&str> = registered.iter().map(|l| l.name.as_str()).collect();
                (event, names)
            }))
            .finish()
    }
}
