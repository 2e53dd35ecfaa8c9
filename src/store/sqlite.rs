//! SQLite store backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::errors::StoreError;
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::schema::{DeadLetter, JobRecord, JobStatus, NewJob, Priority};
use crate::store::{FailOutcome, JobStore};
use crate::util::schedule_at;

/// A [`JobStore`] backed by a SQLite database.
///
/// Timestamps are stored as Unix milliseconds so that due-time comparisons
/// happen in SQL. The pool is restricted to a single connection, which keeps
/// `sqlite::memory:` databases coherent and serializes writers the way
/// SQLite wants anyway.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS background_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type TEXT NOT NULL,
        data TEXT NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        scheduled_at_ms INTEGER NOT NULL,
        locked_until_ms INTEGER,
        created_at_ms INTEGER NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS background_jobs_due
        ON background_jobs (status, scheduled_at_ms)
    ",
    r"
    CREATE TABLE IF NOT EXISTS dead_letter_jobs (
        id INTEGER PRIMARY KEY,
        job_type TEXT NOT NULL,
        data TEXT NOT NULL,
        priority INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        abandoned_at_ms INTEGER NOT NULL
    )
    ",
];

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite:jobs.db?mode=rwc` or `sqlite::memory:`)
    /// and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn time_from_millis(value: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Corrupt(format!("column {column} holds invalid timestamp {value}")))
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let priority_raw: i64 = row.try_get("priority")?;
    let priority = i16::try_from(priority_raw)
        .ok()
        .and_then(Priority::from_i16)
        .ok_or_else(|| StoreError::Corrupt(format!("job {id} has invalid priority {priority_raw}")))?;
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("job {id} has invalid status {status_raw:?}")))?;
    let data_raw: String = row.try_get("data")?;
    let data = serde_json::from_str(&data_raw)
        .map_err(|e| StoreError::Corrupt(format!("job {id} holds unparsable payload: {e}")))?;
    let attempts: i64 = row.try_get("attempts")?;
    let locked_until = row
        .try_get::<Option<i64>, _>("locked_until_ms")?
        .map(|value| time_from_millis(value, "locked_until_ms"))
        .transpose()?;

    Ok(JobRecord {
        id,
        job_type: row.try_get("job_type")?,
        data,
        priority,
        status,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        scheduled_at: time_from_millis(row.try_get("scheduled_at_ms")?, "scheduled_at_ms")?,
        locked_until,
        created_at: time_from_millis(row.try_get("created_at_ms")?, "created_at_ms")?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter, StoreError> {
    let id: i64 = row.try_get("id")?;
    let priority_raw: i64 = row.try_get("priority")?;
    let priority = i16::try_from(priority_raw)
        .ok()
        .and_then(Priority::from_i16)
        .ok_or_else(|| StoreError::Corrupt(format!("dead letter {id} has invalid priority")))?;
    let data_raw: String = row.try_get("data")?;
    let data = serde_json::from_str(&data_raw)
        .map_err(|e| StoreError::Corrupt(format!("dead letter {id} holds unparsable payload: {e}")))?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(DeadLetter {
        id,
        job_type: row.try_get("job_type")?,
        data,
        priority,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        created_at: time_from_millis(row.try_get("created_at_ms")?, "created_at_ms")?,
        abandoned_at: time_from_millis(row.try_get("abandoned_at_ms")?, "abandoned_at_ms")?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError> {
        let data = job.data.to_string();
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (job_type, data, priority, status, attempts, scheduled_at_ms, created_at_ms)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5)
            RETURNING id
            ",
        )
        .bind(&job.job_type)
        .bind(data)
        .bind(i64::from(job.priority.as_i16()))
        .bind(millis(job.scheduled_at))
        .bind(millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM background_jobs
            WHERE status IN ('pending', 'failed') AND scheduled_at_ms <= ?1
            ORDER BY scheduled_at_ms ASC, priority DESC, id ASC
            LIMIT ?2
            ",
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let claimed = sqlx::query(
            r"
            UPDATE background_jobs
            SET status = 'executing', attempts = attempts + 1, locked_until_ms = ?1
            WHERE id = ?2 AND status IN ('pending', 'failed')
            ",
        )
        .bind(millis(schedule_at(now, expiry)))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM background_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            // Claimed a row that vanished before we could read it back.
            None => Err(StoreError::Corrupt(format!(
                "job {id} disappeared while being locked"
            ))),
        }
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM background_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM background_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = match row {
            Some(row) => record_from_row(&row)?,
            None => return Ok(FailOutcome::Lost),
        };
        if job.status != JobStatus::Executing {
            return Ok(FailOutcome::Lost);
        }

        let outcome = match policy.decide(job.attempts, kind) {
            RetryDecision::RetryAfter(delay) => {
                let next = schedule_at(now, delay);
                sqlx::query(
                    r"
                    UPDATE background_jobs
                    SET status = 'failed', last_error = ?1,
                        scheduled_at_ms = ?2, locked_until_ms = NULL
                    WHERE id = ?3
                    ",
                )
                .bind(error)
                .bind(millis(next))
                .bind(id)
                .execute(&mut *tx)
                .await?;
                FailOutcome::Rescheduled(next)
            }
            RetryDecision::Abandon => {
                sqlx::query(
                    r"
                    INSERT INTO dead_letter_jobs
                        (id, job_type, data, priority, attempts, last_error,
                         created_at_ms, abandoned_at_ms)
                    SELECT id, job_type, data, priority, attempts, ?1, created_at_ms, ?2
                    FROM background_jobs
                    WHERE id = ?3
                    ",
                )
                .bind(error)
                .bind(millis(now))
                .bind(id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM background_jobs WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                FailOutcome::Abandoned
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let orphaned = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM background_jobs WHERE status = 'executing' AND locked_until_ms IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        if orphaned > 0 {
            return Err(StoreError::Corrupt(format!(
                "{orphaned} executing job(s) hold no lock expiry"
            )));
        }

        let reclaimed = sqlx::query(
            r"
            UPDATE background_jobs
            SET status = 'pending', locked_until_ms = NULL
            WHERE status = 'executing' AND locked_until_ms < ?1
            ",
        )
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(reclaimed.rows_affected())
    }

    async fn load(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM background_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letter_jobs ORDER BY abandoned_at_ms DESC, id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn runnable_count(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r"
            SELECT COUNT(*) FROM background_jobs
            WHERE status = 'executing'
               OR (status IN ('pending', 'failed') AND scheduled_at_ms <= ?1)
            ",
        )
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
