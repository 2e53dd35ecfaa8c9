//! In-memory store backend.
//!
//! Not durable across process restarts; intended for tests and for
//! deployments where losing queued jobs on shutdown is acceptable. Shares
//! the exact locking and retry semantics of the SQLite backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::schema::{DeadLetter, JobRecord, JobStatus, NewJob};
use crate::store::{FailOutcome, JobStore};
use crate::util::schedule_at;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<i64, JobRecord>,
    dead: Vec<DeadLetter>,
    next_id: i64,
}

/// A [`JobStore`] backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_runnable(job: &JobRecord) -> bool {
    matches!(job.status, JobStatus::Pending | JobStatus::Failed)
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError> {
        let mut inner = self.locked();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.insert(
            id,
            JobRecord {
                id,
                job_type: job.job_type,
                data: job.data,
                priority: job.priority,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                scheduled_at: job.scheduled_at,
                locked_until: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.locked();
        let mut due: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|job| is_runnable(job) && job.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.locked();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !is_runnable(job) {
            return Ok(None);
        }
        job.status = JobStatus::Executing;
        job.attempts += 1;
        job.locked_until = Some(schedule_at(now, expiry));
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        self.locked().jobs.remove(&id);
        Ok(())
    }

    async fn fail(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome, StoreError> {
        let mut inner = self.locked();
        let decision = match inner.jobs.get(&id) {
            Some(job) if job.status == JobStatus::Executing => policy.decide(job.attempts, kind),
            // The lock expired and was reclaimed (or the job is gone); the
            // reporting worker lost the claim.
            _ => return Ok(FailOutcome::Lost),
        };
        match decision {
            RetryDecision::RetryAfter(delay) => {
                let next = schedule_at(now, delay);
                if let Some(job) = inner.jobs.get_mut(&id) {
                    job.status = JobStatus::Failed;
                    job.last_error = Some(error.to_string());
                    job.scheduled_at = next;
                    job.locked_until = None;
                }
                Ok(FailOutcome::Rescheduled(next))
            }
            RetryDecision::Abandon => {
                if let Some(job) = inner.jobs.remove(&id) {
                    inner.dead.push(DeadLetter {
                        id: job.id,
                        job_type: job.job_type,
                        data: job.data,
                        priority: job.priority,
                        attempts: job.attempts,
                        last_error: error.to_string(),
                        created_at: job.created_at,
                        abandoned_at: now,
                    });
                }
                Ok(FailOutcome::Abandoned)
            }
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.locked();
        let mut reclaimed = 0;
        for job in inner.jobs.values_mut() {
            if job.status != JobStatus::Executing {
                continue;
            }
            let Some(locked_until) = job.locked_until else {
                return Err(StoreError::Corrupt(format!(
                    "job {} is executing but holds no lock expiry",
                    job.id
                )));
            };
            if locked_until < now {
                job.status = JobStatus::Pending;
                job.locked_until = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn load(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.locked().jobs.get(&id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self.locked().dead.iter().rev().take(limit).cloned().collect())
    }

    async fn runnable_count(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let inner = self.locked();
        let count = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Executing
                    || (is_runnable(job) && job.scheduled_at <= now)
            })
            .count();
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Priority;
    use chrono::TimeDelta;
    use claims::{assert_none, assert_some};
    use serde_json::json;

    fn new_job(job_type: &str, priority: Priority, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: job_type.to_string(),
            data: json!({}),
            priority,
            scheduled_at,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn insert_assigns_unique_ids() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        let b = store.insert(new_job("b", Priority::Normal, now)).await.unwrap();
        assert_ne!(a, b);

        let record = assert_some!(store.load(a).await.unwrap());
        assert_eq!(record.job_type, "a");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn list_due_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let late = store
            .insert(new_job("late", Priority::Urgent, now + TimeDelta::seconds(60)))
            .await
            .unwrap();
        let low = store
            .insert(new_job("low", Priority::Low, now - TimeDelta::seconds(5)))
            .await
            .unwrap();
        let high = store
            .insert(new_job("high", Priority::High, now - TimeDelta::seconds(5)))
            .await
            .unwrap();
        let earlier = store
            .insert(new_job("earlier", Priority::Low, now - TimeDelta::seconds(30)))
            .await
            .unwrap();

        let due: Vec<i64> = store
            .list_due(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        // Earlier time first, then priority, and the delayed urgent job is
        // absent no matter its priority.
        assert_eq!(due, vec![earlier, high, low]);
        assert!(!due.contains(&late));

        let limited = store.list_due(now, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn try_lock_claims_exactly_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();

        let claimed = assert_some!(store.try_lock(id, now, Duration::from_secs(60)).await.unwrap());
        assert_eq!(claimed.status, JobStatus::Executing);
        assert_eq!(claimed.attempts, 1);
        assert_some!(claimed.locked_until);

        assert_none!(store.try_lock(id, now, Duration::from_secs(60)).await.unwrap());
        assert!(store.list_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        store.try_lock(id, now, Duration::from_secs(60)).await.unwrap();

        store.complete(id).await.unwrap();
        assert_none!(store.load(id).await.unwrap());
        store.complete(id).await.unwrap();
    }

    #[tokio::test]
    async fn fail_reschedules_with_backoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        store.try_lock(id, now, Duration::from_secs(60)).await.unwrap();

        let outcome = store
            .fail(id, "boom", FailureKind::Transient, now, &policy(5))
            .await
            .unwrap();
        let expected = now + TimeDelta::seconds(10);
        assert_eq!(outcome, FailOutcome::Rescheduled(expected));

        let record = assert_some!(store.load(id).await.unwrap());
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(record.scheduled_at, expected);

        // Not due until the backoff elapses, then listed again.
        assert!(store.list_due(now, 10).await.unwrap().is_empty());
        assert_eq!(store.list_due(expected, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_immediately() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        store.try_lock(id, now, Duration::from_secs(60)).await.unwrap();

        let outcome = store
            .fail(id, "bad payload", FailureKind::Permanent, now, &policy(5))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Abandoned);
        assert_none!(store.load(id).await.unwrap());

        let dead = store.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error, "bad payload");
    }

    #[tokio::test]
    async fn attempt_limit_forces_abandonment() {
        let store = MemoryStore::new();
        let mut now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();

        for attempt in 1..=3u32 {
            now = now + TimeDelta::seconds(3600);
            let claimed = assert_some!(
                store.try_lock(id, now, Duration::from_secs(60)).await.unwrap()
            );
            assert_eq!(claimed.attempts, attempt);
            let outcome = store
                .fail(id, "still broken", FailureKind::Transient, now, &policy(3))
                .await
                .unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, FailOutcome::Rescheduled(_)));
            } else {
                assert_eq!(outcome, FailOutcome::Abandoned);
            }
        }

        assert_none!(store.load(id).await.unwrap());
        let dead = store.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    async fn reclaim_expired_releases_stale_locks() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        store.try_lock(id, now, Duration::from_secs(30)).await.unwrap();

        // Lock still fresh: nothing to reclaim.
        assert_eq!(store.reclaim_expired(now).await.unwrap(), 0);

        let later = now + TimeDelta::seconds(31);
        assert_eq!(store.reclaim_expired(later).await.unwrap(), 1);

        let record = assert_some!(store.load(id).await.unwrap());
        assert_eq!(record.status, JobStatus::Pending);
        assert_none!(record.locked_until);

        // The job can be claimed again; the attempt count keeps growing.
        let reclaimed = assert_some!(
            store.try_lock(id, later, Duration::from_secs(30)).await.unwrap()
        );
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn fail_after_reclaim_reports_lost_claim() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(new_job("a", Priority::Normal, now)).await.unwrap();
        store.try_lock(id, now, Duration::from_secs(1)).await.unwrap();
        store.reclaim_expired(now + TimeDelta::seconds(2)).await.unwrap();

        let outcome = store
            .fail(id, "too late", FailureKind::Transient, now, &policy(5))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Lost);

        let record = assert_some!(store.load(id).await.unwrap());
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_none!(record.last_error);
    }

    #[tokio::test]
    async fn runnable_count_tracks_due_and_executing_jobs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = store.insert(new_job("due", Priority::Normal, now)).await.unwrap();
        store
            .insert(new_job("later", Priority::Normal, now + TimeDelta::seconds(60)))
            .await
            .unwrap();

        assert_eq!(store.runnable_count(now).await.unwrap(), 1);
        store.try_lock(due, now, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.runnable_count(now).await.unwrap(), 1);
        store.complete(due).await.unwrap();
        assert_eq!(store.runnable_count(now).await.unwrap(), 0);
    }
}
