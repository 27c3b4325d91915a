//! Background task that flushes the outbox on a fixed cadence.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::store::OutboxStore;

use super::OutboxFlusher;

/// Totals accumulated by a [`FlusherWorker`] over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub cycles: usize,
    pub delivered: usize,
    pub retried: usize,
    /// Failed listener invocations.
    pub failures: usize,
    /// Runs that could not claim records at all.
    pub errors: usize,
}

/// Runs [`OutboxFlusher::process_all_pending_events`] every `poll_interval`.
///
/// ```ignore
/// let worker = FlusherWorker::spawn(emitter.flusher(FlusherConfig::default()));
/// // ... emit events ...
/// let stats = worker.stop().await;
/// println!("delivered {} records", stats.delivered);
/// ```
///
/// Must be spawned from within a tokio runtime. Dropping the worker without
/// calling [`stop`](Self::stop) ends the loop after the current run.
pub struct FlusherWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<WorkerStats>,
}

impl FlusherWorker {
    pub fn spawn<S>(flusher: OutboxFlusher<S>) -> Self
    where
        S: OutboxStore + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll_interval = flusher.settings().poll_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut stats = WorkerStats::default();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                stats.cycles += 1;
                match flusher.process_all_pending_events().await {
                    Ok(report) => {
                        stats.delivered += report.delivered();
                        stats.retried += report.retried();
                        stats.failures += report.failures().count();
                    }
                    Err(err) => {
                        stats.errors += 1;
                        error!(
                            worker_id = %flusher.settings().worker_id,
                            error = %err,
                            "Outbox flush failed"
                        );
                    }
                }
            }

            debug!(
                worker_id = %flusher.settings().worker_id,
                cycles = stats.cycles,
                "Flusher worker stopped"
            );
            stats
        });

        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Signal the loop to stop and wait for the in-flight run to finish.
    pub async fn stop(mut self) -> WorkerStats {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match (&mut self.handle).await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "Flusher worker task did not finish cleanly");
                WorkerStats::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
