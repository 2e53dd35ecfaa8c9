//! Job record types shared by the store backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch ordering hint among jobs competing at the same due time.
///
/// `Immediate` is a reserved band: ready jobs in it are dispatched ahead of
/// all other ready jobs, regardless of how long those have been waiting.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched after all other bands.
    Low,
    /// The default band.
    #[default]
    Normal,
    /// Dispatched before `Normal` and `Low`.
    High,
    /// Dispatched before all regular bands.
    Urgent,
    /// Reserved band processed ahead of every other ready job.
    Immediate,
}

impl Priority {
    /// Numeric representation used by the SQL backends.
    pub fn as_i16(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
            Priority::Immediate => 4,
        }
    }

    /// Inverse of [`Priority::as_i16`].
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            4 => Some(Priority::Immediate),
            _ => None,
        }
    }
}

/// Lifecycle state of a job record.
///
/// Transitions are monotone: `Pending → Executing → {removed | Failed}`,
/// `Failed → Executing` (retry) or dead-lettered once the attempt limit is
/// reached. An expired lock moves `Executing` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a worker, lock held until `locked_until`.
    Executing,
    /// Failed at least once, waiting for its retry time.
    Failed,
}

impl JobStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Executing => "executing",
            JobStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "executing" => Some(JobStatus::Executing),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A durable background job record.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Store-assigned unique identifier.
    pub id: i64,
    /// Discriminator resolved to a registered handler at dispatch time.
    pub job_type: String,
    /// Opaque JSON payload passed to the handler.
    pub data: Value,
    /// Dispatch ordering hint.
    pub priority: Priority,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Number of execution attempts started so far. Never decreases.
    pub attempts: u32,
    /// Error message recorded by the most recent failed attempt.
    pub last_error: Option<String>,
    /// Absolute time before which the job must not be dispatched.
    pub scheduled_at: DateTime<Utc>,
    /// Lock expiry; `Some` if and only if the record is `Executing`.
    pub locked_until: Option<DateTime<Utc>>,
    /// Time the record was created.
    pub created_at: DateTime<Utc>,
}

/// A job record as submitted by `enqueue`, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Discriminator resolved to a registered handler at dispatch time.
    pub job_type: String,
    /// Opaque JSON payload passed to the handler.
    pub data: Value,
    /// Dispatch ordering hint.
    pub priority: Priority,
    /// Absolute time before which the job must not be dispatched.
    pub scheduled_at: DateTime<Utc>,
}

/// A permanently abandoned job, retained for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Id the job had in the main table.
    pub id: i64,
    /// Discriminator of the abandoned job.
    pub job_type: String,
    /// Payload of the abandoned job.
    pub data: Value,
    /// Priority the job was enqueued with.
    pub priority: Priority,
    /// Total execution attempts made before abandonment.
    pub attempts: u32,
    /// Error recorded by the final failed attempt.
    pub last_error: String,
    /// Time the job was originally created.
    pub created_at: DateTime<Utc>,
    /// Time the job was abandoned.
    pub abandoned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
        assert!(Priority::Urgent < Priority::Immediate);
    }

    #[test]
    fn priority_roundtrips_through_i16() {
        for priority in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
            Priority::Immediate,
        ] {
            assert_eq!(Priority::from_i16(priority.as_i16()), Some(priority));
        }
        assert_eq!(Priority::from_i16(17), None);
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [JobStatus::Pending, JobStatus::Executing, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("abandoned?"), None);
    }
}
