use crate::background_job::BackgroundJob;
use crate::errors::DecodeError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Maps job type names to the functions that decode and run them.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.job_types
            .insert(J::JOB_TYPE.to_string(), Arc::new(runnable::<J>));
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.job_types.keys().cloned().collect()
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RunTaskFn<Context>> {
        self.job_types.get(job_type).map(|run| run.as_ref())
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    payload: Value,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        let job: J = serde_json::from_value(payload).map_err(|source| DecodeError {
            job_type: J::JOB_TYPE,
            source,
        })?;
        job.run(ctx).await
    }
    .boxed()
}
