//! User signup with a welcome mail sent through the outbox.
//!
//! Run with `RUST_LOG=outbox_rust=debug cargo run --example signup`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outbox_rust::{
    async_trait, listener_fn, Entity, EntityStoreExt, Listener, ListenerError, Mutation,
    OutboxConfig, OutboxEvent, SqliteStore, TransactionalEmitter,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize, Entity)]
#[entity(kind = "users")]
struct User {
    id: String,
    email: String,
}

#[derive(Debug, Serialize, Deserialize, OutboxEvent)]
struct UserCreated {
    user_id: String,
    email: String,
}

/// Fails on its first attempt to show the retry path.
struct WelcomeMailer {
    attempts: AtomicUsize,
}

#[async_trait]
impl Listener<UserCreated> for WelcomeMailer {
    async fn handle(&self, event: UserCreated) -> Result<(), ListenerError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("smtp connection refused".into());
        }
        tracing::info!(email = %event.email, "Sent welcome mail");
        Ok(())
    }
}

const CONFIG: &str = r#"{
    "events": [
        {
            "name": "UserCreated",
            "listeners": {
                "expiresAtTTL": 60000,
                "readyToRetryAfterTTL": 200,
                "maxExecutionTimeTTL": 2000
            }
        }
    ],
    "retryInterval": 200,
    "batchSize": 10
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = OutboxConfig::from_json(CONFIG)?;
    let emitter = TransactionalEmitter::from_config(SqliteStore::open_in_memory()?, &config)?;
    let events: Vec<&str> = emitter.config().event_names().collect();
    tracing::info!(?events, "Loaded outbox configuration");

    emitter.add_listener::<UserCreated, _>(
        "welcome-mail",
        WelcomeMailer {
            attempts: AtomicUsize::new(0),
        },
    )?;
    let indexed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&indexed);
    emitter.add_listener::<UserCreated, _>(
        "search-index",
        listener_fn(move |event: UserCreated| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tracing::info!(user_id = %event.user_id, "Indexed user");
                Ok::<(), ListenerError>(())
            }
        }),
    )?;

    let user = User {
        id: "u-1".into(),
        email: "ada@example.com".into(),
    };
    let record = emitter.emit(
        &UserCreated {
            user_id: user.id.clone(),
            email: user.email.clone(),
        },
        vec![Mutation::persist(&user)?],
    )?;
    let stored: Option<User> = emitter.store().load(&user.id)?;
    tracing::info!(record_id = record.id, ?stored, "Signed up user");

    let flusher = emitter.flusher(config.flusher_config().with_worker_id("signup-demo"));
    let first = flusher.deliver(record.id).await?;
    tracing::info!(status = ?first.status, "First delivery attempt");

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let report = flusher.process_all_pending_events().await?;
        if report.delivered() > 0 {
            break;
        }
    }

    tracing::info!(
        indexed = indexed.load(Ordering::SeqCst),
        "Outbox drained"
    );
    Ok(())
}
