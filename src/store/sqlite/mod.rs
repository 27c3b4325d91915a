//! SQLite-backed store.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! due-ness can be evaluated in SQL. `event_payload` and
//! `delivered_to_listeners` are JSON text columns.

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use crate::entity::Mutation;
use crate::outbox::{after, NewOutboxRecord, OutboxRecord};

use super::{OutboxStore, StoreError, StoreResult};

const RECORD_COLUMNS: &str = "id, event_name, event_payload, inserted_at, expire_at, \
     ready_to_retry_after, delivered_to_listeners, claimed_by, claimed_until";

/// Due at ?1 and not leased at ?1.
const CLAIMABLE: &str = "expire_at > ?1 \
     AND (ready_to_retry_after IS NULL OR ready_to_retry_after <= ?1) \
     AND (claimed_until IS NULL OR claimed_until <= ?1)";

/// Store backed by a pool of SQLite connections.
///
/// Claims run inside `BEGIN IMMEDIATE` transactions, which take SQLite's
/// write lock up front, so flushers in different processes sharing one
/// database file never claim the same record.
///
/// Calls block while SQLite waits on its write lock (up to the 5s busy
/// timeout). [`OutboxFlusher`](crate::OutboxFlusher) runs them on tokio's
/// blocking pool; async callers of `emit` should do the same.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub const DEFAULT_POOL_SIZE: u32 = 8;

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_pool_size(path, Self::DEFAULT_POOL_SIZE)
    }

    pub fn open_with_pool_size(path: impl AsRef<Path>, max_size: u32) -> StoreResult<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)?;

        info!(path = %path.display(), max_size, "Opened SQLite outbox store");
        Self::from_pool(pool)
    }

    /// A private in-memory database, dropped with the store.
    pub fn open_in_memory() -> StoreResult<Self> {
        // Each `:memory:` connection is its own database, so the pool keeps exactly one alive.
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        {
            let conn = pool.get()?;
            migrations::run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Blocks until a connection is free or the pool timeout passes.
    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run a write whose WHERE clause requires `claimed_by = worker_id`.
    fn update_held<F>(&self, id: u64, worker_id: &str, write: F) -> StoreResult<()>
    where
        F: FnOnce(&Connection, i64) -> rusqlite::Result<usize>,
    {
        let conn = self.conn()?;
        let sql_id = to_sql_id(id)?;
        if write(&*conn, sql_id)? == 0 {
            return Err(not_held(&conn, id, sql_id, worker_id)?);
        }
        Ok(())
    }
}

/// Raw column values; decoded outside rusqlite's row callback.
struct RecordRow {
    id: i64,
    event_name: String,
    event_payload: String,
    inserted_at: i64,
    expire_at: i64,
    ready_to_retry_after: Option<i64>,
    delivered_to_listeners: String,
    claimed_by: Option<String>,
    claimed_until: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_name: row.get(1)?,
            event_payload: row.get(2)?,
            inserted_at: row.get(3)?,
            expire_at: row.get(4)?,
            ready_to_retry_after: row.get(5)?,
            delivered_to_listeners: row.get(6)?,
            claimed_by: row.get(7)?,
            claimed_until: row.get(8)?,
        })
    }

    fn decode(self) -> StoreResult<OutboxRecord> {
        Ok(OutboxRecord {
            id: u64::try_from(self.id)
                .map_err(|_| StoreError::InvalidData(format!("negative record id {}", self.id)))?,
            event_name: self.event_name,
            event_payload: serde_json::from_str(&self.event_payload)?,
            inserted_at: from_micros(self.inserted_at)?,
            expire_at: from_micros(self.expire_at)?,
            ready_to_retry_after: self.ready_to_retry_after.map(from_micros).transpose()?,
            delivered_to_listeners: serde_json::from_str(&self.delivered_to_listeners)?,
            claimed_by: self.claimed_by,
            claimed_until: self.claimed_until.map(from_micros).transpose()?,
        })
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {micros}")))
}

fn to_sql_id(id: u64) -> StoreResult<i64> {
    i64::try_from(id).map_err(|_| StoreError::RecordNotFound(id))
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn select_records(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<OutboxRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox_events {filter}");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params, RecordRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RecordRow::decode).collect()
}

fn select_record(conn: &Connection, id: i64) -> StoreResult<Option<OutboxRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = ?1");
    conn.query_row(&sql, params![id], RecordRow::from_row)
        .optional()?
        .map(RecordRow::decode)
        .transpose()
}

/// Why a write conditioned on `claimed_by` matched no row.
fn not_held(conn: &Connection, id: u64, sql_id: i64, worker_id: &str) -> StoreResult<StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM outbox_events WHERE id = ?1",
            params![sql_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(if exists {
        StoreError::ClaimLost {
            id,
            worker_id: worker_id.to_string(),
        }
    } else {
        StoreError::RecordNotFound(id)
    })
}

impl OutboxStore for SqliteStore {
    fn commit(
        &self,
        mutations: &[Mutation],
        records: Vec<NewOutboxRecord>,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let mut conn = self.conn()?;
        // Dropping `tx` on any early return rolls the whole unit back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for mutation in mutations {
            match mutation {
                Mutation::Persist { kind, id, data } => {
                    tx.execute(
                        "INSERT INTO outbox_entities (kind, id, data) VALUES (?1, ?2, ?3)
                         ON CONFLICT (kind, id) DO UPDATE SET data = excluded.data",
                        params![kind, id, serde_json::to_string(data)?],
                    )?;
                }
                Mutation::Remove { kind, id } => {
                    let removed = tx.execute(
                        "DELETE FROM outbox_entities WHERE kind = ?1 AND id = ?2",
                        params![kind, id],
                    )?;
                    if removed == 0 {
                        return Err(StoreError::EntityNotFound {
                            kind: kind.clone(),
                            id: id.clone(),
                        });
                    }
                }
            }
        }

        let mut stored = Vec::with_capacity(records.len());
        for new in records {
            tx.execute(
                "INSERT INTO outbox_events
                    (event_name, event_payload, inserted_at, expire_at, ready_to_retry_after)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.event_name(),
                    serde_json::to_string(new.event_payload())?,
                    to_micros(new.inserted_at()),
                    to_micros(new.expire_at()),
                    new.ready_to_retry_after().map(to_micros),
                ],
            )?;
            // Read back so callers see timestamps at stored precision.
            let id = tx.last_insert_rowid();
            let record = select_record(&tx, id)?.ok_or_else(|| {
                StoreError::InvalidData(format!("inserted record {id} not found"))
            })?;
            stored.push(record);
        }

        tx.commit()?;
        debug!(
            mutations = mutations.len(),
            records = stored.len(),
            "Committed outbox unit"
        );
        Ok(stored)
    }

    fn get_record(&self, id: u64) -> StoreResult<Option<OutboxRecord>> {
        let conn = self.conn()?;
        select_record(&conn, to_sql_id(id)?)
    }

    fn list_records(&self) -> StoreResult<Vec<OutboxRecord>> {
        let conn = self.conn()?;
        select_records(&conn, "ORDER BY id ASC", [])
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let conn = self.conn()?;
        select_records(
            &conn,
            "WHERE expire_at > ?1
               AND (ready_to_retry_after IS NULL OR ready_to_retry_after <= ?1)
             ORDER BY id ASC LIMIT ?2",
            params![to_micros(now), to_sql_limit(limit)],
        )
    }

    fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let until = to_micros(after(now, lease));

        let ids: Vec<i64> = {
            let sql = format!("SELECT id FROM outbox_events WHERE {CLAIMABLE} ORDER BY id ASC LIMIT ?2");
            let mut stmt = tx.prepare_cached(&sql)?;
            let ids = stmt
                .query_map(params![to_micros(now), to_sql_limit(limit)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE outbox_events SET claimed_by = ?1, claimed_until = ?2 WHERE id = ?3",
                params![worker_id, until, id],
            )?;
            if let Some(record) = select_record(&tx, id)? {
                claimed.push(record);
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    fn claim_record(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = to_sql_id(id)?;

        let changed = tx.execute(
            "UPDATE outbox_events SET claimed_by = ?1, claimed_until = ?2
             WHERE id = ?3 AND expire_at > ?4
               AND (claimed_until IS NULL OR claimed_until <= ?4)",
            params![worker_id, to_micros(after(now, lease)), id, to_micros(now)],
        )?;
        let record = if changed == 0 {
            None
        } else {
            select_record(&tx, id)?
        };

        tx.commit()?;
        Ok(record)
    }

    fn renew_claim(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<OutboxRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql_id = to_sql_id(id)?;

        let changed = tx.execute(
            "UPDATE outbox_events SET claimed_until = ?1 WHERE id = ?2 AND claimed_by = ?3",
            params![to_micros(after(now, lease)), sql_id, worker_id],
        )?;
        if changed == 0 {
            return Err(not_held(&tx, id, sql_id, worker_id)?);
        }
        let record = select_record(&tx, sql_id)?.ok_or(StoreError::RecordNotFound(id))?;

        tx.commit()?;
        Ok(record)
    }

    fn record_delivery(&self, id: u64, worker_id: &str, listener: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql_id = to_sql_id(id)?;

        let (delivered, claimed_by): (String, Option<String>) = tx
            .query_row(
                "SELECT delivered_to_listeners, claimed_by FROM outbox_events WHERE id = ?1",
                params![sql_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::RecordNotFound(id))?;
        if claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimLost {
                id,
                worker_id: worker_id.to_string(),
            });
        }

        let mut delivered: Vec<String> = serde_json::from_str(&delivered)?;
        if !delivered.iter().any(|name| name == listener) {
            delivered.push(listener.to_string());
            tx.execute(
                "UPDATE outbox_events SET delivered_to_listeners = ?1 WHERE id = ?2",
                params![serde_json::to_string(&delivered)?, sql_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn schedule_retry(
        &self,
        id: u64,
        worker_id: &str,
        ready_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.update_held(id, worker_id, |conn, sql_id| {
            conn.execute(
                "UPDATE outbox_events
                 SET ready_to_retry_after = ?1, claimed_by = NULL, claimed_until = NULL
                 WHERE id = ?2 AND claimed_by = ?3",
                params![to_micros(ready_at), sql_id, worker_id],
            )
        })
    }

    fn release(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        self.update_held(id, worker_id, |conn, sql_id| {
            conn.execute(
                "UPDATE outbox_events SET claimed_by = NULL, claimed_until = NULL
                 WHERE id = ?1 AND claimed_by = ?2",
                params![sql_id, worker_id],
            )
        })
    }

    fn complete(&self, id: u64, worker_id: &str) -> StoreResult<()> {
        self.update_held(id, worker_id, |conn, sql_id| {
            conn.execute(
                "DELETE FROM outbox_events WHERE id = ?1 AND claimed_by = ?2",
                params![sql_id, worker_id],
            )
        })
    }

    fn delete_record(&self, id: u64) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM outbox_events WHERE id = ?1",
            params![to_sql_id(id)?],
        )?;
        Ok(removed > 0)
    }

    fn load_entity(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM outbox_entities WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|data| serde_json::from_str(&data))
            .transpose()
            .map_err(StoreError::from)
    }
}
