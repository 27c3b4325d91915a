use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{EventConfigTable, FlusherConfig, OutboxConfig};
use crate::entity::Mutation;
use crate::error::{OutboxError, OutboxResult};
use crate::event::OutboxEvent;
use crate::flusher::OutboxFlusher;
use crate::listener::{Listener, ListenerRegistry, RegisteredListener};
use crate::outbox::{after, NewOutboxRecord, OutboxRecord};
use crate::store::{OutboxStore, StoreError};

use super::UnitOfWork;

/// Couples entity mutations and outbox events into one atomic unit.
///
/// The emitter owns the listener registry; flushers built from it with
/// [`TransactionalEmitter::flusher`] share the same registrations.
///
/// # Example
///
/// ```ignore
/// let emitter = TransactionalEmitter::new(InMemoryStore::new(), config.table()?);
///
/// emitter.add_listener::<UserCreated, _>("welcome-mail", WelcomeMailer)?;
///
/// let user = User { id: "u1".into(), email: "a@example.com".into() };
/// emitter.emit(
///     &UserCreated { user_id: user.id.clone() },
///     vec![Mutation::persist(&user)?],
/// )?;
/// ```
pub struct TransactionalEmitter<S> {
    store: Arc<S>,
    config: Arc<EventConfigTable>,
    registry: ListenerRegistry,
}

impl<S> Clone for TransactionalEmitter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
        }
    }
}

impl<S: OutboxStore> TransactionalEmitter<S> {
    pub fn new(store: S, config: EventConfigTable) -> Self {
        Self::with_registry(Arc::new(store), config, ListenerRegistry::new())
    }

    pub fn from_config(store: S, config: &OutboxConfig) -> OutboxResult<Self> {
        Ok(Self::new(store, config.table()?))
    }

    /// Build on a shared store handle and an existing registry.
    pub fn with_registry(store: Arc<S>, config: EventConfigTable, registry: ListenerRegistry) -> Self {
        Self {
            store,
            config: Arc::new(config),
            registry,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EventConfigTable {
        &self.config
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Apply `mutations` and record `event` in a single commit.
    ///
    /// Fails with [`OutboxError::UnknownEvent`] before touching storage when
    /// the event has no configuration.
    pub fn emit<E: OutboxEvent>(
        &self,
        event: &E,
        mutations: Vec<Mutation>,
    ) -> OutboxResult<OutboxRecord> {
        let mut stored = self
            .unit_of_work()
            .mutations(mutations)
            .event(event)?
            .commit()?;
        stored.pop().ok_or_else(|| {
            StoreError::InvalidData("commit returned no outbox record".to_string()).into()
        })
    }

    /// Start a unit of work that can carry several mutations and events.
    pub fn unit_of_work(&self) -> UnitOfWork<'_, S> {
        UnitOfWork::new(self)
    }

    pub fn add_listener<E, L>(&self, name: impl Into<String>, listener: L) -> OutboxResult<()>
    where
        E: OutboxEvent,
        L: Listener<E>,
    {
        let name = name.into();
        self.registry.add::<E, L>(name.clone(), listener)?;
        debug!(event_name = E::EVENT_NAME, listener = %name, "Registered outbox listener");
        Ok(())
    }

    pub fn remove_listeners(&self, event_name: &str) -> usize {
        let removed = self.registry.remove_all(event_name);
        debug!(event_name, removed, "Removed outbox listeners");
        removed
    }

    pub fn get_listeners(&self, event_name: &str) -> Vec<RegisteredListener> {
        self.registry.get(event_name)
    }

    pub(crate) fn prepare<E: OutboxEvent>(
        &self,
        event: &E,
        now: DateTime<Utc>,
    ) -> OutboxResult<NewOutboxRecord> {
        let config = self
            .config
            .get(E::EVENT_NAME)
            .ok_or_else(|| OutboxError::UnknownEvent {
                event_name: E::EVENT_NAME.to_string(),
            })?;

        let payload = serde_json::to_value(event)?;
        let expire_at = after(now, config.expires_at_ttl);
        let ready_to_retry_after = config.ready_to_retry_after_ttl.map(|ttl| after(now, ttl));

        Ok(NewOutboxRecord::create(
            E::EVENT_NAME,
            payload,
            expire_at,
            ready_to_retry_after,
        ))
    }
}

impl<S: OutboxStore + 'static> TransactionalEmitter<S> {
    /// A flusher over the same store, configuration and listeners.
    pub fn flusher(&self, config: FlusherConfig) -> OutboxFlusher<S> {
        OutboxFlusher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            self.registry.clone(),
            config,
        )
    }
}
