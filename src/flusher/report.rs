use chrono::{DateTime, Utc};

use crate::error::DeliveryFailure;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ListenerOutcome {
    Delivered,
    Failed(DeliveryFailure),
}

/// One listener invocation for one record.
#[derive(Debug)]
pub struct ListenerAttempt {
    pub listener: String,
    pub outcome: ListenerOutcome,
}

impl ListenerAttempt {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, ListenerOutcome::Delivered)
    }

    pub fn failure(&self) -> Option<&DeliveryFailure> {
        match &self.outcome {
            ListenerOutcome::Failed(failure) => Some(failure),
            ListenerOutcome::Delivered => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No listener is registered for the event name.
    NoListeners,
    /// The event name is missing from the configuration table.
    UnknownEvent,
    /// The record is missing, expired, or held by another flusher.
    NotClaimable,
}

#[derive(Debug)]
pub enum RecordStatus {
    /// Every listener has handled the record and it was deleted.
    Delivered,
    /// At least one listener failed; the next attempt is due at `ready_at`.
    RetryScheduled { ready_at: DateTime<Utc> },
    Skipped(SkipReason),
    /// A state update failed. The record keeps what was stored before the failure.
    Aborted(StoreError),
}

/// What happened to one record during a flush.
#[derive(Debug)]
pub struct RecordOutcome {
    pub record_id: u64,
    pub event_name: String,
    pub status: RecordStatus,
    pub attempts: Vec<ListenerAttempt>,
}

impl RecordOutcome {
    pub(crate) fn skipped(record_id: u64, event_name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            record_id,
            event_name: event_name.into(),
            status: RecordStatus::Skipped(reason),
            attempts: Vec::new(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.status, RecordStatus::Delivered)
    }

    pub fn is_retry_scheduled(&self) -> bool {
        matches!(self.status, RecordStatus::RetryScheduled { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RecordStatus::Skipped(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RecordStatus::Aborted(_))
    }
}

/// Aggregated result of a `process_all_pending_events` run.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub records: Vec<RecordOutcome>,
}

impl FlushReport {
    pub(crate) fn push(&mut self, outcome: RecordOutcome) {
        self.records.push(outcome);
    }

    /// Records claimed during the run.
    pub fn claimed(&self) -> usize {
        self.records.len()
    }

    pub fn delivered(&self) -> usize {
        self.records.iter().filter(|r| r.is_delivered()).count()
    }

    pub fn retried(&self) -> usize {
        self.records.iter().filter(|r| r.is_retry_scheduled()).count()
    }

    pub fn skipped(&self) -> usize {
        self.records.iter().filter(|r| r.is_skipped()).count()
    }

    pub fn aborted(&self) -> usize {
        self.records.iter().filter(|r| r.is_aborted()).count()
    }

    /// Every failed listener invocation as `(record_id, listener, failure)`.
    pub fn failures(&self) -> impl Iterator<Item = (u64, &str, &DeliveryFailure)> {
        self.records.iter().flat_map(|record| {
            record.attempts.iter().filter_map(move |attempt| {
                attempt
                    .failure()
                    .map(|failure| (record.record_id, attempt.listener.as_str(), failure))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
