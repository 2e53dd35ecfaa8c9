use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::{EnqueueError, JobError};
use crate::schema::{NewJob, Priority};
use crate::store::JobStore;
use crate::util::schedule_at;

/// Priority and delay applied to a single enqueue call.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Dispatch ordering hint. Defaults to [`Priority::Normal`].
    pub priority: Priority,
    /// How long to hold the job before it becomes due. Defaults to zero,
    /// i.e. due immediately.
    pub delay: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            delay: Duration::ZERO,
        }
    }
}

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task.
    ///
    /// [`Self::enqueue_with`] can be used to override the priority value.
    const PRIORITY: Priority = Priority::Normal;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// `cancel` fires when the dispatcher begins a cooperative shutdown;
    /// long-running handlers should observe it and return early. A job still
    /// running when the shutdown grace period expires is failed with a
    /// cancellation error and handed to the normal retry policy.
    fn run(
        &self,
        ctx: Self::Context,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), JobError>> + Send;

    /// Enqueue this job with its default priority and no delay.
    ///
    /// Returns the id of the persisted job record. This is the only point at
    /// which a failure is reported to the caller; once the record exists, all
    /// later failures surface through job-status queries and the dead-letter
    /// table instead.
    #[instrument(name = "stoker.enqueue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, store: &'a dyn JobStore) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        self.enqueue_with(
            store,
            EnqueueOptions {
                priority: Self::PRIORITY,
                delay: Duration::ZERO,
            },
        )
    }

    /// Enqueue this job with an explicit priority and delay.
    #[instrument(name = "stoker.enqueue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue_with<'a>(
        &'a self,
        store: &'a dyn JobStore,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        async move {
            let job = NewJob {
                job_type: Self::JOB_NAME.to_string(),
                data,
                priority: options.priority,
                scheduled_at: schedule_at(Utc::now(), options.delay),
            };
            Ok(store.insert(job).await?)
        }
        .boxed()
    }
}
