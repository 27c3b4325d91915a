use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(1);

/// Settings for [`OutboxFlusher`](crate::OutboxFlusher) and
/// [`FlusherWorker`](crate::FlusherWorker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlusherConfig {
    /// Max records processed per `process_all_pending_events` run.
    pub batch_size: usize,
    /// Retry delay for events without a `readyToRetryAfterTTL`.
    pub retry_interval: Duration,
    /// Cadence of the background worker.
    pub poll_interval: Duration,
    /// How long a claim protects a record from other flushers. Before each
    /// listener runs the claim is extended by `maxExecutionTimeTTL` on top.
    pub lease: Duration,
    /// Owner tag written to `claimed_by`. Must differ between flushers that
    /// share a store; the default is unique within the process.
    pub worker_id: String,
}

impl FlusherConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 100;
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            retry_interval: Self::DEFAULT_RETRY_INTERVAL,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
            worker_id: format!(
                "flusher-{}-{}",
                std::process::id(),
                NEXT_WORKER.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }
}
