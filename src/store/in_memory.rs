use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entity::Mutation;
use crate::outbox::{after, NewOutboxRecord, OutboxRecord};

use super::{OutboxStore, StoreError, StoreResult};

type EntityKey = (String, String);

#[derive(Default)]
struct State {
    entities: HashMap<EntityKey, Value>,
    records: BTreeMap<u64, OutboxRecord>,
    last_id: u64,
}

/// Process-local store. Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, operation: &'static str) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    fn write(&self, operation: &'static str) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    fn update<F>(&self, id: u64, worker_id: &str, operation: &'static str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut state = self.write(operation)?;
        f(held(&mut state.records, id, worker_id)?);
        Ok(())
    }
}

fn held<'a>(
    records: &'a mut BTreeMap<u64, OutboxRecord>,
    id: u64,
    worker_id: &str,
) -> StoreResult<&'a mut OutboxRecord> {
    let record = records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))?;
    if record.claimed_by.as_deref() != Some(worker_id) {
        return Err(StoreError::ClaimLost {
            id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(record)
}

/// Plan every mutation first so a failing one leaves the store untouched.
fn stage(
    entities: &HashMap<EntityKey, Value>,
    mutations: &[Mutation],
) -> StoreResult<Vec<(EntityKey, Option<Value>)>> {
    let mut staged: HashMap<EntityKey, Option<Value>> = HashMap::new();
    let mut order = Vec::new();

    for mutation in mutations {
        let key = (mutation.kind().to_string(), mutation.id().to_string());
        let next = match mutation {
            Mutation::Persist { data, .. } => Some(data.clone()),
            Mutation::Remove { kind, id } => {
                let exists = match staged.get(&key) {
                    Some(value) => value.is_some(),
                    None => entities.contains_key(&key),
                };
                if !exists {
                    return Err(StoreError::EntityNotFound {
                        kind: kind.clone(),
                        id: id.clone(),
                    });
                }
                None
            }
        };
        if staged.insert(key.clone(), next).is_none() {
            order.push(key);
        }
    }

    Ok(order
        .into_iter()
        .map(|key| {
            let value = staged.remove(&key).flatten();
            (key, value)
        })
        .collect())
}

fn claimable(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
    record.is_due(now) && !record.is_claimed(now)
}

impl OutboxStore for InMemoryStore {
    fn commit(
        &self,
        mutations: &[Mutation],
        records: Vec<NewOutboxRecord>,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let mut state = self.write("commit")?;
        let staged = stage(&state.entities, mutations)?;

        for (key, value) in staged {
            match value {
                Some(data) => {
                    state.entities.insert(key, data);
                }
                None => {
                    state.entities.remove(&key);
                }
            }
        }

        let mut stored = Vec::with_capacity(records.len());
        for new in records {
            state.last_id += 1;
            let record = new.into_record(state.last_id);
            state.records.insert(record.id, record.clone());
            stored.push(record);
        }

        Ok(stored)
    }

    fn get_record(&self, id: u64) -> StoreResult<Option<OutboxRecord>> {
        Ok(self.read("get record")?.records.get(&id).cloned())
    }

    fn list_records(&self) -> StoreResult<Vec<OutboxRecord>> {
        Ok(self.read("list records")?.records.values().cloned().collect())
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.read("find due")?;
        Ok(state
            .records
            .values()
            .filter(|record| record.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let mut state = self.write("claim due")?;
        let until = after(now, lease);
        let mut claimed = Vec::new();

        for record in state.records.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !claimable(record, now) {
                continue;
            }
            record.claimed_by = Some(worker_id.to_string());
            record.claimed_until = Some(until);
            claimed.push(record.clone());
        }

        Ok(claimed)
    }

    fn claim_record(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        let mut state = self.write("claim record")?;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        if record.is_expired(now) || record.is_claimed(now) {
            return Ok(None);
        }
        record.claimed_by = Some(worker_id.to_string());
        record.claimed_until = Some(after(now, lease));
        Ok(Some(record.clone()))
    }

    fn renew_claim(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<OutboxRecord> {
        let mut state = self.write("renew claim")?;
        let record = held(&mut state.records, id, worker_id)?;
        record.claimed_until = Some(after(now, lease));
        Ok(record.clone())
    }

    fn record_delivery(&self, id: u64, worker_id: &str, listener: &str) -> StoreResult<()> {
        self.update(id, worker_id, "record delivery", |record| {
            record.mark_delivered(listener);
        })
    }

    fn schedule_retry(
        &self,
        id: u64,
        worker_id: &str,
        ready_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.update(id, worker_id, "schedule retry", |record| {
            record.ready_to_retry_after = Some(ready_at);
            record.claimed_by = None;
            record.claimed_until = None;
        })
    }

    fn release(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        self.update(id, worker_id, "release", |record| {
            record.claimed_by = None;
            record.claimed_until = None;
        })
    }

    fn complete(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        let mut state = self.write("complete")?;
        held(&mut state.records, id, worker_id)?;
        state.records.remove(&id);
        Ok(())
    }

    fn delete_record(&self, id: u64) -> StoreResult<bool> {
        Ok(self.write("delete record")?.records.remove(&id).is_some())
    }

    fn load_entity(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        let key = (kind.to_string(), id.to_string());
        Ok(self.read("load entity")?.entities.get(&key).cloned())
    }
}
