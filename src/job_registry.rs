use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::background_job::BackgroundJob;
use crate::errors::JobError;

type RunFn<Context> = Arc<
    dyn Fn(Context, Value, CancellationToken) -> BoxFuture<'static, Result<(), JobError>>
        + Send
        + Sync,
>;

/// Maps job-type discriminators to type-erased handler callbacks.
pub(crate) struct JobRegistry<Context> {
    handlers: HashMap<&'static str, RunFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.handlers.insert(
            J::JOB_NAME,
            Arc::new(|context, data, cancel| {
                Box::pin(async move {
                    // A payload that cannot deserialize will never succeed,
                    // no matter how often it is retried.
                    let job: J = serde_json::from_value(data).map_err(|e| {
                        JobError::permanent(anyhow::anyhow!(
                            "invalid payload for job type {}: {e}",
                            J::JOB_NAME
                        ))
                    })?;
                    job.run(context, cancel).await
                })
            }),
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RunFn<Context>> {
        self.handlers.get(job_type)
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
