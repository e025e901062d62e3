use crate::job_registry::JobRegistry;
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) queue_name: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) retry_base_delay: Duration,
    pub(crate) shutdown: CancellationToken,
}

/// What happened to a job after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Succeeded,
    Retrying,
    DeadLettered,
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

    /// Sleeps for one poll interval. Returns `false` if shutdown was requested meanwhile.
    async fn idle(&self) -> bool {
        let sleep_duration = self.sleep_duration_with_jitter();
        tokio::select! {
            () = sleep(sleep_duration) => true,
            () = self.shutdown.cancelled() => false,
        }
    }

    /// Run background jobs until shutdown is requested, or until the queue is
    /// empty if `shutdown_when_queue_empty` is set.
    ///
    /// Shutdown is only observed between jobs. A job that already started is
    /// always run to completion.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some((job_id, outcome))) => {
                    trace!(job.id = job_id, ?outcome, "Job finished");
                }
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    trace!("No pending background worker jobs found. Polling again…");
                    if !self.idle().await {
                        break;
                    }
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some((job_id, outcome)))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error retrieving or updating the job
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run_next_job(&self) -> anyhow::Result<Option<(i64, JobOutcome)>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let pool = &self.connection_pool;

        let job_types = job_registry.job_types();

        trace!("Looking for next background worker job…");

        // The transaction holds the row lock for the whole run
        let mut tx = pool.begin().await?;

        let job = match storage::find_next_unlocked_job_tx(
            &mut tx,
            &self.queue_name,
            &job_types,
            self.retry_base_delay,
        )
        .await
        {
            Ok(job) => job,
            Err(sqlx::Error::RowNotFound) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            job.queue = %job.queue,
            job.attempt = job.retries + 1,
        );

        let job_id = job.id;
        debug!(parent: &span, "Running job…");

        let future = with_sentry_transaction(&job.job_type, async || {
            let run_task_fn = job_registry
                .get(&job.job_type)
                .ok_or_else(|| anyhow!("Unknown job type {}", job.job_type))?;

            AssertUnwindSafe(run_task_fn(context, job.data.clone()))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let _enter = span.enter();
        let outcome = match result {
            Ok(()) => {
                debug!("Deleting successful job…");
                storage::delete_successful_job(&mut tx, job_id).await?;
                JobOutcome::Succeeded
            }
            Err(error) if job.retries >= job.max_retries => {
                let message = format!("{error:#}");
                error!(
                    retries = job.retries,
                    max_retries = job.max_retries,
                    "Job exhausted its retries, moving it to the dead-letter table: {message}"
                );
                storage::dead_letter_job(&mut tx, job_id, &message).await?;
                JobOutcome::DeadLettered
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!("Failed to run job: {message}");
                storage::update_failed_job(&mut tx, job_id, &message).await?;
                JobOutcome::Retrying
            }
        };
        tx.commit().await?;

        Ok(Some((job_id, outcome)))
    }
}
