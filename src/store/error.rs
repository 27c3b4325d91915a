use thiserror::Error;

/// Persistence failures. A failed call leaves stored state as it was.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    #[error("entity {kind}/{id} does not exist")]
    EntityNotFound { kind: String, id: String },

    #[error("outbox record {0} does not exist")]
    RecordNotFound(u64),

    #[error("outbox record {id} is no longer claimed by {worker_id}")]
    ClaimLost { id: u64, worker_id: String },

    #[error("store task for {operation} did not complete: {reason}")]
    TaskFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StoreError {
    /// The record is gone or held by someone else, so the caller must not
    /// touch it again.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, Self::ClaimLost { .. } | Self::RecordNotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
