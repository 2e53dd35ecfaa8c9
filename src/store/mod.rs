//! Durable job record storage.
//!
//! The store is the single source of truth for job records; everything held
//! in memory (the ready queue in particular) is a cache rebuilt from it. Its
//! conditional-update lock is the sole mutual-exclusion mechanism across
//! worker slots and across process instances.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::retry::{FailureKind, RetryPolicy};
use crate::schema::{DeadLetter, JobRecord, NewJob};

/// Result of recording a failed execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was rescheduled for another attempt at the given time.
    Rescheduled(DateTime<Utc>),
    /// The job was moved to the dead-letter table.
    Abandoned,
    /// The reporting worker no longer held the claim; its lock had expired
    /// and been reclaimed. Nothing was recorded.
    Lost,
}

/// A durable table of pending/executing/failed jobs.
///
/// Implementations must make [`try_lock`](JobStore::try_lock) an atomic
/// conditional update so that concurrent dispatchers never claim the same
/// record twice, and must tolerate process restart without losing records.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job record and return its id.
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError>;

    /// Due `Pending`/`Failed` records, ordered by (scheduled time, priority
    /// descending, id), at most `limit` of them.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<JobRecord>, StoreError>;

    /// Exclusively claim a record before execution.
    ///
    /// Atomically moves `Pending`/`Failed` to `Executing`, increments the
    /// attempt count and sets the lock expiry to `now + expiry`. Returns the
    /// claimed record, or `None` if another dispatcher already transitioned
    /// the row (a benign race).
    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Delete a successfully executed record. Calling this twice for the same
    /// id is a no-op the second time.
    async fn complete(&self, id: i64) -> Result<(), StoreError>;

    /// Record a failed execution attempt, applying the retry policy: either
    /// reschedule with backoff or move the record to the dead-letter table.
    async fn fail(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome, StoreError>;

    /// Move `Executing` records whose lock expired back to `Pending` so they
    /// are dispatched again. Returns the number of reclaimed records.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Look up a single record, e.g. for job-status queries.
    async fn load(&self, id: i64) -> Result<Option<JobRecord>, StoreError>;

    /// Most recently abandoned jobs, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    /// Number of records that are due now or currently executing. Used by
    /// workers configured to shut down once the queue drains.
    async fn runnable_count(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
