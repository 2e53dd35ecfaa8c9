//! Polling scheduler: promotes due job records into the ready queue and
//! reclaims expired locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::errors::StoreError;
use crate::ready_queue::{ReadyEntry, ReadyQueue};
use crate::store::JobStore;

pub(crate) struct Scheduler {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) ready_queue: Arc<ReadyQueue>,
    pub(crate) poll_interval: Duration,
    pub(crate) batch_limit: usize,
    pub(crate) shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) async fn run(self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Shutdown requested. Stopping the scheduler…");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(()) => {}
                        // A corrupt record implies a bug in the locking
                        // protocol, not a flaky database.
                        Err(error @ StoreError::Corrupt(_)) => {
                            error!(%error, "Job store invariant violated");
                        }
                        Err(error) => {
                            warn!(%error, "Scheduler tick failed. Retrying next interval…");
                        }
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        let reclaimed = self.store.reclaim_expired(now).await?;
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed expired job locks");
        }

        let due = self.store.list_due(now, self.batch_limit).await?;
        for job in due {
            self.ready_queue.push(ReadyEntry {
                id: job.id,
                priority: job.priority,
                scheduled_at: job.scheduled_at,
            });
        }

        trace!(queue.depth = self.ready_queue.len(), "Scheduler tick complete");
        Ok(())
    }
}
