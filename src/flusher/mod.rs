mod flusher;
mod report;
mod worker;

pub use flusher::OutboxFlusher;
pub use report::{FlushReport, ListenerAttempt, ListenerOutcome, RecordOutcome, RecordStatus, SkipReason};
pub use worker::{FlusherWorker, WorkerStats};
