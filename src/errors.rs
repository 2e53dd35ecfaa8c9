use thiserror::Error;

/// Errors reported by a job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database failed or is unreachable. Transient; callers
    /// retry on the next cycle.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record violates an invariant of the locking protocol, e.g. an
    /// executing row with no lock expiry. Indicates a bug, surfaced as a hard
    /// operational alarm rather than retried.
    #[error("job store corrupt: {0}")]
    Corrupt(String),
}

/// The only caller-visible failure mode of the enqueue operation. Once a job
/// is persisted, downstream failures are observable solely through job-status
/// queries and dead-letter inspection.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a job handler.
///
/// Transient failures are rescheduled with backoff until the attempt limit is
/// reached; permanent failures are dead-lettered immediately.
#[derive(Debug, Error)]
pub enum JobError {
    /// The failure may resolve on its own; retry with backoff.
    #[error("{0}")]
    Transient(anyhow::Error),

    /// Retrying can never succeed; abandon the job immediately.
    #[error("{0}")]
    Permanent(anyhow::Error),
}

impl JobError {
    /// A failure worth retrying.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        JobError::Transient(error.into())
    }

    /// A failure that no retry can fix.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        JobError::Permanent(error.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        JobError::Transient(error)
    }
}
