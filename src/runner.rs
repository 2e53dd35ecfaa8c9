use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use crate::background_job::BackgroundJob;
use crate::job_registry::JobRegistry;
use crate::ready_queue::ReadyQueue;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_BATCH_LIMIT: usize = 100;
const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(10 * 60);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Marker type for a configured runner.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;

/// Marker type for an unconfigured runner.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The long-lived scheduler/dispatcher object.
///
/// Constructed once by the hosting process and shared by reference with
/// everything that needs to enqueue work. At least one job type must be
/// registered before [`start`](Runner::start) becomes available.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: Arc<dyn JobStore>,
    context: Context,
    job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    batch_limit: usize,
    lock_expiry: Duration,
    job_timeout: Duration,
    retry_policy: RetryPolicy,
    shutdown_grace: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static, State> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given job store and context.
    pub fn new(store: Arc<dyn JobStore>, context: Context) -> Self {
        Self {
            store,
            context,
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            batch_limit: DEFAULT_BATCH_LIMIT,
            lock_expiry: DEFAULT_LOCK_EXPIRY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Set the number of concurrent worker slots.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often the scheduler polls the store for due jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter workers add to their idle backoff.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound the number of due records promoted per scheduler tick. Keeps
    /// memory use bounded under backlog.
    pub fn batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Set how long a claim on a job lasts before the reaper may hand the
    /// job to another worker. Must comfortably exceed the job timeout.
    pub fn lock_expiry(mut self, lock_expiry: Duration) -> Self {
        self.lock_expiry = lock_expiry;
        self
    }

    /// Set the per-job execution timeout. A handler exceeding it is treated
    /// as a transient failure.
    pub fn job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Set the retry and abandonment policy applied to failed jobs.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set how long [`RunHandle::stop`] waits for in-flight jobs before
    /// failing them with a cancellation error.
    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Register a job type, making the runner startable.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        Runner {
            store: self.store,
            context: self.context,
            job_registry: self.job_registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            batch_limit: self.batch_limit,
            lock_expiry: self.lock_expiry,
            job_timeout: self.job_timeout,
            retry_policy: self.retry_policy,
            shutdown_grace: self.shutdown_grace,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the polling scheduler and the background workers.
    ///
    /// This returns a [`RunHandle`] which is used to stop the system again,
    /// or to wait for it to drain.
    pub fn start(&self) -> RunHandle {
        let ready_queue = Arc::new(ReadyQueue::new());
        let shutdown = CancellationToken::new();
        let force_stop = CancellationToken::new();
        let scheduler_shutdown = CancellationToken::new();
        let job_registry = Arc::new(self.job_registry.clone());

        let scheduler = Scheduler {
            store: Arc::clone(&self.store),
            ready_queue: Arc::clone(&ready_queue),
            poll_interval: self.poll_interval,
            batch_limit: self.batch_limit,
            shutdown: scheduler_shutdown.clone(),
        };
        let scheduler_handle =
            tokio::spawn(scheduler.run().instrument(info_span!("scheduler")));

        let worker_tracker = TaskTracker::new();
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                store: Arc::clone(&self.store),
                ready_queue: Arc::clone(&ready_queue),
                context: self.context.clone(),
                job_registry: Arc::clone(&job_registry),
                retry_policy: self.retry_policy,
                lock_expiry: self.lock_expiry,
                job_timeout: self.job_timeout,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                shutdown: shutdown.clone(),
                force_stop: force_stop.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            worker_tracker.spawn(async move { worker.run().instrument(span).await });
        }
        worker_tracker.close();

        RunHandle {
            worker_tracker,
            scheduler_handle,
            shutdown,
            force_stop,
            scheduler_shutdown,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Handle to a running background job processing system.
#[derive(Debug)]
pub struct RunHandle {
    worker_tracker: TaskTracker,
    scheduler_handle: JoinHandle<()>,
    shutdown: CancellationToken,
    force_stop: CancellationToken,
    scheduler_shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl RunHandle {
    /// Cooperatively stop the system.
    ///
    /// Stops pulling new entries immediately, signals cancellation to
    /// in-flight handlers and waits up to the shutdown grace period for them
    /// to finish. Any job still running after that is failed with a
    /// "cancelled at shutdown" error and handed to the normal retry policy.
    pub async fn stop(self) {
        info!("Stopping background workers…");
        self.shutdown.cancel();
        self.scheduler_shutdown.cancel();

        if timeout(self.shutdown_grace, self.worker_tracker.wait())
            .await
            .is_err()
        {
            warn!("Shutdown grace period expired. Failing jobs still in flight…");
            self.force_stop.cancel();
            self.worker_tracker.wait().await;
        }

        if let Err(error) = self.scheduler_handle.await {
            warn!(%error, "Scheduler task panicked");
        }
        info!("Background workers stopped");
    }

    /// Wait for all background workers to shut down on their own.
    ///
    /// Only useful together with
    /// [`shutdown_when_queue_empty`](Runner::shutdown_when_queue_empty).
    pub async fn wait_for_shutdown(self) {
        self.worker_tracker.wait().await;
        self.scheduler_shutdown.cancel();
        if let Err(error) = self.scheduler_handle.await {
            warn!(%error, "Scheduler task panicked");
        }
    }
}
