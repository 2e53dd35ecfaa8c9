use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::errors::{JobError, StoreError};
use crate::job_registry::JobRegistry;
use crate::ready_queue::{ReadyEntry, ReadyQueue};
use crate::retry::{FailureKind, RetryPolicy};
use crate::schema::JobRecord;
use crate::store::{FailOutcome, JobStore};
use crate::util::try_to_extract_panic_info;

pub(crate) struct Worker<Context> {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) ready_queue: Arc<ReadyQueue>,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) lock_expiry: Duration,
    pub(crate) job_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown_when_queue_empty: bool,
    /// Cooperative shutdown: stop pulling entries, let handlers observe it.
    pub(crate) shutdown: CancellationToken,
    /// Fired when the shutdown grace period expires; in-flight jobs are
    /// failed with a cancellation error.
    pub(crate) force_stop: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run ready jobs until shutdown, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            let Some(entry) = self.ready_queue.pop_ready(Utc::now()) else {
                if self.shutdown_when_queue_empty && self.queue_is_empty().await {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }

                let sleep_duration = self.sleep_duration_with_jitter();
                trace!("No ready background worker jobs found. Polling again in {sleep_duration:?}…");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = sleep(sleep_duration) => {}
                }
                continue;
            };

            if let Err(error) = self.run_job(entry).await {
                error!(%error, "Failed to run job");
                sleep(self.sleep_duration_with_jitter()).await;
            }
        }
    }

    async fn queue_is_empty(&self) -> bool {
        match self.store.runnable_count(Utc::now()).await {
            Ok(count) => count == 0,
            Err(error) => {
                warn!(%error, "Failed to check for remaining jobs");
                false
            }
        }
    }

    /// Claim and execute a single ready entry.
    ///
    /// Handler faults of any kind are contained here and converted into a
    /// `fail` outcome; only store-level errors propagate to the slot loop.
    async fn run_job(&self, entry: ReadyEntry) -> Result<(), StoreError> {
        let Some(job) = self
            .store
            .try_lock(entry.id, Utc::now(), self.lock_expiry)
            .await?
        else {
            // Benign race: another dispatcher won the claim.
            trace!(job.id = entry.id, "Job was already claimed. Discarding entry…");
            return Ok(());
        };

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);

        debug!(parent: &span, "Running job…");
        let result = self.execute(&job).instrument(span.clone()).await;

        async {
            match result {
                Ok(()) => {
                    debug!("Deleting successful job…");
                    self.store.complete(job.id).await?;
                }
                Err((kind, message)) => {
                    warn!(error = %message, "Failed to run job");
                    let outcome = self
                        .store
                        .fail(job.id, &message, kind, Utc::now(), &self.retry_policy)
                        .await?;
                    match outcome {
                        FailOutcome::Rescheduled(next) => {
                            debug!(job.retry_at = %next, "Job rescheduled");
                        }
                        FailOutcome::Abandoned => {
                            warn!(
                                job.attempts = job.attempts,
                                "Job abandoned to the dead-letter table"
                            );
                        }
                        FailOutcome::Lost => {
                            debug!("Job claim was lost before the failure could be recorded");
                        }
                    }
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &JobRecord) -> Result<(), (FailureKind, String)> {
        let Some(run_job_fn) = self.job_registry.get(&job.job_type) else {
            // Fail fast: an unregistered discriminator cannot resolve later.
            return Err((
                FailureKind::Permanent,
                format!("unknown job type {}", job.job_type),
            ));
        };

        let cancel = self.shutdown.child_token();
        let future = AssertUnwindSafe(run_job_fn(self.context.clone(), job.data.clone(), cancel))
            .catch_unwind();

        let outcome = tokio::select! {
            outcome = timeout(self.job_timeout, future) => outcome,
            _ = self.force_stop.cancelled() => {
                return Err((FailureKind::Transient, "job cancelled at shutdown".to_string()));
            }
        };

        match outcome {
            Err(_elapsed) => Err((
                FailureKind::Timeout,
                format!("job exceeded its timeout of {:?}", self.job_timeout),
            )),
            Ok(Err(panic)) => Err((
                FailureKind::Transient,
                try_to_extract_panic_info(&*panic).to_string(),
            )),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(JobError::Permanent(error)))) => {
                Err((FailureKind::Permanent, format!("{error:#}")))
            }
            Ok(Ok(Err(JobError::Transient(error)))) => {
                Err((FailureKind::Transient, format!("{error:#}")))
            }
        }
    }
}
