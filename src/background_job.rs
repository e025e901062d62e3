use crate::errors::EnqueueError;
use crate::task_queue::{NewTask, TaskHandle, TaskQueue};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// The default retry budget of a job.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application, and producers and
    /// consumers MUST agree on it.
    const JOB_TYPE: &'static str;

    /// Default priority of the task inside its queue.
    const PRIORITY: i16 = 0;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an unstarted
    /// job with the same data in the same queue; the handle of that job is
    /// returned instead.
    const DEDUPLICATED: bool = false;

    /// Number of retries before the job is moved to the dead-letter table.
    ///
    /// [`EnqueueOptions::max_retries`] can be used to override it.
    const MAX_RETRIES: i32 = DEFAULT_MAX_RETRIES;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for immediate background execution.
    fn enqueue<'a>(
        &'a self,
        queue: &'a dyn TaskQueue,
    ) -> BoxFuture<'a, Result<TaskHandle, EnqueueError>> {
        self.enqueue_with(queue, EnqueueOptions::default())
    }

    /// Enqueue this job with explicit delivery options.
    #[instrument(name = "workers.enqueue", skip(self, queue), fields(message = Self::JOB_TYPE))]
    fn enqueue_with<'a>(
        &'a self,
        queue: &'a dyn TaskQueue,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<TaskHandle, EnqueueError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        let task = NewTask {
            job_type: Self::JOB_TYPE.to_string(),
            payload,
            queue: Self::QUEUE.to_string(),
            priority: options.priority.unwrap_or(Self::PRIORITY),
            delay: options.delay,
            max_retries: options.max_retries.unwrap_or(Self::MAX_RETRIES),
            deduplicated: Self::DEDUPLICATED,
        };

        queue.enqueue(task)
    }
}

/// Per-submission overrides of a job's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    delay: Duration,
    max_retries: Option<i32>,
    priority: Option<i16>,
}

impl EnqueueOptions {
    /// Deliver the job no earlier than `delay` from now.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override [`BackgroundJob::MAX_RETRIES`].
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override [`BackgroundJob::PRIORITY`].
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }
}
