use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::{EventConfig, EventConfigTable, FlusherConfig};
use crate::error::{DeliveryFailure, OutboxResult};
use crate::listener::{ListenerRegistry, RegisteredListener};
use crate::outbox::{after, OutboxRecord};
use crate::store::{OutboxStore, StoreError, StoreResult};

use super::report::{
    FlushReport, ListenerAttempt, ListenerOutcome, RecordOutcome, RecordStatus, SkipReason,
};

/// Delivers due outbox records to their listeners.
///
/// Listeners of one record run one after another in registration order.
/// Each success is persisted before the next listener starts, so a crash
/// never re-invokes a listener that already succeeded. A failing listener
/// pushes the record's `ready_to_retry_after` out; the failure is reported
/// in the [`FlushReport`], not returned.
///
/// Before each listener runs, the claim is renewed for the listener's
/// `maxExecutionTimeTTL` plus the lease, so no other flusher can claim the
/// record mid-invocation. If the claim was lost anyway, the record is left
/// to its new holder. Store calls run on tokio's blocking pool.
pub struct OutboxFlusher<S> {
    store: Arc<S>,
    config: Arc<EventConfigTable>,
    registry: ListenerRegistry,
    settings: FlusherConfig,
}

impl<S> Clone for OutboxFlusher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: OutboxStore + 'static> OutboxFlusher<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<EventConfigTable>,
        registry: ListenerRegistry,
        settings: FlusherConfig,
    ) -> Self {
        Self {
            store,
            config,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &FlusherConfig {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Process the backlog of due records, at most `batch_size` per run.
    ///
    /// Only a failure to claim records is returned as an error; everything
    /// that happens to individual records is in the report.
    pub async fn process_all_pending_events(&self) -> OutboxResult<FlushReport> {
        let mut report = FlushReport::default();
        // Skipped records stay claimed until the run ends so they are not picked up again.
        let mut held = Vec::new();

        while report.claimed() < self.settings.batch_size {
            let remaining = self.settings.batch_size - report.claimed();
            let lease = self.settings.lease;
            let claimed = match self
                .blocking("claim due", move |store, worker_id| {
                    store.claim_due(worker_id, Utc::now(), lease, remaining)
                })
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    self.release_all(&held).await;
                    return Err(err.into());
                }
            };
            if claimed.is_empty() {
                break;
            }
            debug!(
                worker_id = %self.settings.worker_id,
                count = claimed.len(),
                "Claimed outbox records"
            );

            for record in claimed {
                let outcome = self.process_record(record).await;
                if outcome.is_skipped() {
                    held.push(outcome.record_id);
                }
                report.push(outcome);
            }
        }

        self.release_all(&held).await;

        if !report.is_empty() {
            info!(
                worker_id = %self.settings.worker_id,
                claimed = report.claimed(),
                delivered = report.delivered(),
                retried = report.retried(),
                skipped = report.skipped(),
                aborted = report.aborted(),
                "Flushed outbox"
            );
        }
        Ok(report)
    }

    /// Deliver one record now, ignoring its `ready_to_retry_after`.
    ///
    /// Meant to run right after [`emit`](crate::TransactionalEmitter::emit);
    /// the configured retry delay then keeps pollers away while this runs.
    pub async fn deliver(&self, record_id: u64) -> OutboxResult<RecordOutcome> {
        let lease = self.settings.lease;
        let claimed = self
            .blocking("claim record", move |store, worker_id| {
                store.claim_record(record_id, worker_id, Utc::now(), lease)
            })
            .await?;
        let Some(record) = claimed else {
            return Ok(RecordOutcome::skipped(record_id, "", SkipReason::NotClaimable));
        };

        let outcome = self.process_record(record).await;
        if outcome.is_skipped() {
            self.release_all(&[outcome.record_id]).await;
        }
        Ok(outcome)
    }

    async fn process_record(&self, mut record: OutboxRecord) -> RecordOutcome {
        let Some(event_config) = self.config.get(&record.event_name).copied() else {
            warn!(
                record_id = record.id,
                event_name = %record.event_name,
                "Outbox record has no event configuration"
            );
            return RecordOutcome::skipped(record.id, record.event_name, SkipReason::UnknownEvent);
        };

        let listeners = self.registry.get(&record.event_name);
        if listeners.is_empty() {
            debug!(
                record_id = record.id,
                event_name = %record.event_name,
                "No listeners registered; leaving record in place"
            );
            return RecordOutcome::skipped(record.id, record.event_name, SkipReason::NoListeners);
        }

        // One invocation plus the writes that follow it.
        let hold = event_config
            .max_execution_time_ttl
            .saturating_add(self.settings.lease);
        let mut attempts = Vec::new();
        let mut failed = false;

        for listener in &listeners {
            let id = record.id;
            record = match self
                .blocking("renew claim", move |store, worker_id| {
                    store.renew_claim(id, worker_id, Utc::now(), hold)
                })
                .await
            {
                Ok(current) => current,
                Err(err) => return self.abort(record, attempts, "renew claim", err).await,
            };
            if record.has_delivered(listener.name()) {
                continue;
            }

            match self.invoke(listener, &record, &event_config).await {
                Ok(()) => {
                    attempts.push(attempt(listener, ListenerOutcome::Delivered));
                    let name = listener.name().to_string();
                    let persisted = self
                        .blocking("record delivery", move |store, worker_id| {
                            store.record_delivery(id, worker_id, &name)
                        })
                        .await;
                    if let Err(err) = persisted {
                        return self.abort(record, attempts, "record delivery", err).await;
                    }
                    record.mark_delivered(listener.name());
                    debug!(
                        record_id = record.id,
                        listener = listener.name(),
                        "Delivered outbox record"
                    );
                }
                Err(failure) => {
                    warn!(
                        record_id = record.id,
                        event_name = %record.event_name,
                        listener = listener.name(),
                        error = %failure,
                        "Outbox listener failed"
                    );
                    failed = true;
                    attempts.push(attempt(listener, ListenerOutcome::Failed(failure)));
                }
            }
        }

        let id = record.id;
        if failed {
            let delay = event_config
                .ready_to_retry_after_ttl
                .unwrap_or(self.settings.retry_interval);
            let ready_at = after(Utc::now(), delay);
            let scheduled = self
                .blocking("schedule retry", move |store, worker_id| {
                    store.schedule_retry(id, worker_id, ready_at)
                })
                .await;
            if let Err(err) = scheduled {
                return self.abort(record, attempts, "schedule retry", err).await;
            }
            warn!(
                record_id = record.id,
                event_name = %record.event_name,
                %ready_at,
                "Scheduled outbox retry"
            );
            return RecordOutcome {
                record_id: record.id,
                event_name: record.event_name,
                status: RecordStatus::RetryScheduled { ready_at },
                attempts,
            };
        }

        let names = listeners.iter().map(RegisteredListener::name);
        if !record.is_fully_delivered(names) {
            // Unreachable with a stable listener snapshot; keep the record rather than drop it.
            self.release_all(&[record.id]).await;
            return RecordOutcome::skipped(record.id, record.event_name, SkipReason::NoListeners);
        }

        let completed = self
            .blocking("complete", move |store, worker_id| store.complete(id, worker_id))
            .await;
        if let Err(err) = completed {
            return self.abort(record, attempts, "complete", err).await;
        }
        debug!(
            record_id = record.id,
            event_name = %record.event_name,
            "Outbox record fully delivered"
        );
        RecordOutcome {
            record_id: record.id,
            event_name: record.event_name,
            status: RecordStatus::Delivered,
            attempts,
        }
    }

    async fn invoke(
        &self,
        listener: &RegisteredListener,
        record: &OutboxRecord,
        event_config: &EventConfig,
    ) -> Result<(), DeliveryFailure> {
        let limit = event_config.max_execution_time_ttl;
        let call = AssertUnwindSafe(listener.invoke(record.event_payload.clone())).catch_unwind();

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(DeliveryFailure::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(DeliveryFailure::TimedOut(limit)),
        }
    }

    /// Stop working on `record` after a failed store call.
    ///
    /// A record that another flusher now holds is left alone; otherwise the
    /// claim is released so the record can be retried.
    async fn abort(
        &self,
        record: OutboxRecord,
        attempts: Vec<ListenerAttempt>,
        operation: &'static str,
        err: StoreError,
    ) -> RecordOutcome {
        if err.is_claim_lost() {
            warn!(
                record_id = record.id,
                worker_id = %self.settings.worker_id,
                operation,
                error = %err,
                "Lost claim on outbox record"
            );
        } else {
            error!(
                record_id = record.id,
                operation,
                error = %err,
                "Outbox store call failed"
            );
            self.release_all(&[record.id]).await;
        }
        RecordOutcome {
            record_id: record.id,
            event_name: record.event_name,
            status: RecordStatus::Aborted(err),
            attempts,
        }
    }

    async fn release_all(&self, ids: &[u64]) {
        for &id in ids {
            let released = self
                .blocking("release", move |store, worker_id| store.release(id, worker_id))
                .await;
            match released {
                Ok(()) => {}
                Err(err) if err.is_claim_lost() => {
                    debug!(record_id = id, error = %err, "Outbox record already taken over");
                }
                Err(err) => {
                    warn!(record_id = id, error = %err, "Failed to release outbox record");
                }
            }
        }
    }

    /// Run a store call on tokio's blocking pool with this flusher's worker id.
    async fn blocking<T, F>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S, &str) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let worker_id = self.settings.worker_id.clone();
        tokio::task::spawn_blocking(move || call(&*store, worker_id.as_str()))
            .await
            .map_err(|err| StoreError::TaskFailed {
                operation,
                reason: err.to_string(),
            })?
    }
}

fn attempt(listener: &RegisteredListener, outcome: ListenerOutcome) -> ListenerAttempt {
    ListenerAttempt {
        listener: listener.name().to_string(),
        outcome,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
