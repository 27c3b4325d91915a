//! Storage boundary for entities and outbox records.

mod error;
mod in_memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use in_memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entity::{Entity, Mutation};
use crate::outbox::{NewOutboxRecord, OutboxRecord};

/// Persistence for business entities and the outbox table.
///
/// The outbox table is only ever changed through these methods: `commit`
/// inserts, and the flusher-facing calls update or delete single records.
pub trait OutboxStore: Send + Sync {
    /// Apply `mutations` in order and insert `records`, all or nothing.
    ///
    /// Records get monotonically increasing ids and are returned in input order.
    fn commit(
        &self,
        mutations: &[Mutation],
        records: Vec<NewOutboxRecord>,
    ) -> StoreResult<Vec<OutboxRecord>>;

    fn get_record(&self, id: u64) -> StoreResult<Option<OutboxRecord>>;

    /// Every stored record, ordered by id.
    fn list_records(&self) -> StoreResult<Vec<OutboxRecord>>;

    /// Up to `limit` records due at `now`, ordered by id.
    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboxRecord>>;

    /// Claim up to `limit` due records that no other flusher holds.
    ///
    /// Claimed records carry `claimed_by = worker_id` until `now + lease`.
    /// Two concurrent calls never return the same record.
    fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<OutboxRecord>>;

    /// Claim one record regardless of `ready_to_retry_after`.
    ///
    /// Returns `None` when the record is missing, expired, or held by
    /// another flusher.
    fn claim_record(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>>;

    /// Push the claim on a held record out to `now + lease` and return the
    /// record as currently stored.
    ///
    /// The calls from here to [`complete`](Self::complete) only succeed while
    /// `claimed_by` is still `worker_id`. Otherwise they fail with
    /// [`StoreError::ClaimLost`] and change nothing. A lease that ran out
    /// still counts as held until another flusher claims the record.
    fn renew_claim(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<OutboxRecord>;

    /// Append `listener` to the record's delivered set if it is not there yet.
    fn record_delivery(&self, id: u64, worker_id: &str, listener: &str) -> StoreResult<()>;

    /// Push the next attempt out to `ready_at` and release the claim.
    fn schedule_retry(&self, id: u64, worker_id: &str, ready_at: DateTime<Utc>)
        -> StoreResult<()>;

    /// Release the claim without touching anything else.
    fn release(&self, id: u64, worker_id: &str) -> StoreResult<()>;

    /// Delete a fully delivered record.
    fn complete(&self, id: u64, worker_id: &str) -> StoreResult<()>;

    /// Delete a record whoever holds it. Returns whether one was removed.
    fn delete_record(&self, id: u64) -> StoreResult<bool>;

    fn load_entity(&self, kind: &str, id: &str) -> StoreResult<Option<Value>>;
}

impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    fn commit(
        &self,
        mutations: &[Mutation],
        records: Vec<NewOutboxRecord>,
    ) -> StoreResult<Vec<OutboxRecord>> {
        (**self).commit(mutations, records)
    }

    fn get_record(&self, id: u64) -> StoreResult<Option<OutboxRecord>> {
        (**self).get_record(id)
    }

    fn list_records(&self) -> StoreResult<Vec<OutboxRecord>> {
        (**self).list_records()
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        (**self).find_due(now, limit)
    }

    fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<OutboxRecord>> {
        (**self).claim_due(worker_id, now, lease, limit)
    }

    fn claim_record(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        (**self).claim_record(id, worker_id, now, lease)
    }

    fn renew_claim(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<OutboxRecord> {
        (**self).renew_claim(id, worker_id, now, lease)
    }

    fn record_delivery(&self, id: u64, worker_id: &str, listener: &str) -> StoreResult<()> {
        (**self).record_delivery(id, worker_id, listener)
    }

    fn schedule_retry(
        &self,
        id: u64,
        worker_id: &str,
        ready_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        (**self).schedule_retry(id, worker_id, ready_at)
    }

    fn release(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        (**self).release(id, worker_id)
    }

    fn complete(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        (**self).complete(id, worker_id)
    }

    fn delete_record(&self, id: u64) -> StoreResult<bool> {
        (**self).delete_record(id)
    }

    fn load_entity(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        (**self).load_entity(kind, id)
    }
}

/// Typed entity access on top of [`OutboxStore::load_entity`].
pub trait EntityStoreExt: OutboxStore {
    fn load<T: Entity>(&self, id: &str) -> StoreResult<Option<T>> {
        self.load_entity(T::KIND, id)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }
}

impl<S: OutboxStore + ?Sized> EntityStoreExt for S {}
