//! Several mutations and events committed together.
//!
//! ```ignore
//! emitter
//!     .unit_of_work()
//!     .persist(&order)?
//!     .remove(&cart)
//!     .event(&OrderPlaced { order_id: order.id.clone() })?
//!     .event(&CartCleared { cart_id: cart.id.clone() })?
//!     .commit()?;
//! ```

use chrono::Utc;
use tracing::debug;

use crate::entity::{Entity, Mutation};
use crate::error::OutboxResult;
use crate::event::OutboxEvent;
use crate::outbox::{NewOutboxRecord, OutboxRecord};
use crate::store::OutboxStore;

use super::TransactionalEmitter;

/// Builder for one atomic commit. Nothing is persisted until [`commit`](Self::commit).
pub struct UnitOfWork<'a, S> {
    emitter: &'a TransactionalEmitter<S>,
    mutations: Vec<Mutation>,
    records: Vec<NewOutboxRecord>,
}

impl<'a, S: OutboxStore> UnitOfWork<'a, S> {
    pub(super) fn new(emitter: &'a TransactionalEmitter<S>) -> Self {
        Self {
            emitter,
            mutations: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn persist<T: Entity>(mut self, entity: &T) -> OutboxResult<Self> {
        self.mutations.push(Mutation::persist(entity)?);
        Ok(self)
    }

    pub fn remove<T: Entity>(mut self, entity: &T) -> Self {
        self.mutations.push(Mutation::remove(entity));
        self
    }

    pub fn mutation(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn mutations(mut self, mutations: impl IntoIterator<Item = Mutation>) -> Self {
        self.mutations.extend(mutations);
        self
    }

    /// Add an event. Its configuration is checked here, so an unknown event
    /// name fails before anything reaches the store.
    pub fn event<E: OutboxEvent>(mut self, event: &E) -> OutboxResult<Self> {
        let record = self.emitter.prepare(event, Utc::now())?;
        self.records.push(record);
        Ok(self)
    }

    pub fn commit(self) -> OutboxResult<Vec<OutboxRecord>> {
        let stored = self
            .emitter
            .store()
            .commit(&self.mutations, self.records)?;

        for record in &stored {
            debug!(
                record_id = record.id,
                event_name = %record.event_name,
                mutations = self.mutations.len(),
                "Emitted outbox event"
            );
        }
        Ok(stored)
    }
}
