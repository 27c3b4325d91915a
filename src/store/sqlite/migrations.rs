//! Schema migrations for the SQLite outbox store.
//!
//! Migrations run in order and are tracked in `outbox_migrations`. Each one
//! commits together with its version row, in its own immediate transaction.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::store::StoreResult;

pub const CURRENT_VERSION: i32 = 2;

type Migration = fn(&Connection) -> StoreResult<()>;

const MIGRATIONS: [(i32, &str, Migration); 2] = [
    (1, "initial_schema", migrate_v1_initial_schema),
    (2, "due_index", migrate_v2_due_index),
];

pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outbox_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current_version = applied_version(conn)?;
    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Outbox schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running outbox migrations");

    for (version, name, migrate) in MIGRATIONS {
        if version > current_version {
            apply(conn, version, name, migrate)?;
        }
    }

    Ok(())
}

fn applied_version(conn: &Connection) -> StoreResult<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM outbox_migrations",
        [],
        |row| row.get(0),
    )?)
}

fn apply(conn: &Connection, version: i32, name: &str, migrate: Migration) -> StoreResult<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    // Another process may have applied it since the version was read.
    if applied_version(&tx)? >= version {
        return Ok(());
    }
    migrate(&tx)?;
    tx.execute(
        "INSERT INTO outbox_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![version, name, chrono::Utc::now().timestamp_micros()],
    )?;

    tx.commit()?;
    debug!(version, name, "Applied outbox migration");
    Ok(())
}

fn migrate_v1_initial_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outbox_entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        );

        CREATE TABLE IF NOT EXISTS outbox_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_name TEXT NOT NULL,
            event_payload TEXT NOT NULL,
            inserted_at INTEGER NOT NULL,
            expire_at INTEGER NOT NULL,
            ready_to_retry_after INTEGER,
            delivered_to_listeners TEXT NOT NULL DEFAULT '[]',
            claimed_by TEXT,
            claimed_until INTEGER
        );",
    )?;
    Ok(())
}

fn migrate_v2_due_index(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_events_due
         ON outbox_events (expire_at, ready_to_retry_after)",
        [],
    )?;
    Ok(())
}
