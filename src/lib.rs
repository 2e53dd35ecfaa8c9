#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod errors;
mod job_registry;
mod ready_queue;
mod retry;
mod runner;
mod scheduler;
/// Job record types shared by the store backends.
pub mod schema;
/// Durable job record storage.
pub mod store;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// Per-call priority and delay for enqueueing.
pub use self::background_job::EnqueueOptions;
/// Error types for enqueueing, storage and handler outcomes.
pub use self::errors::{EnqueueError, JobError, StoreError};
/// Failure classification and the retry/abandonment policy.
pub use self::retry::{FailureKind, RetryDecision, RetryPolicy};
/// Priority bands for enqueued jobs.
pub use self::schema::Priority;
/// The runner that orchestrates job scheduling and dispatch.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
/// Cancellation signal passed to job handlers during cooperative shutdown.
pub use tokio_util::sync::CancellationToken;
