use crate::background_job::BackgroundJob;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(30);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for locking and running jobs
///
/// Jobs are routed to named queues. Every queue carries a relative weight,
/// and the runner's concurrency budget is split between the queues in
/// proportion to those weights, so a queue with weight 6 gets roughly twice
/// the workers of a queue with weight 3.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    queues: BTreeMap<String, Queue>,
    job_registry: JobRegistry<Context>,
    context: Context,
    concurrency: usize,
    retry_base_delay: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues)
            .field("job_registry", &self.job_registry)
            .field("context", &self.context)
            .field("concurrency", &self.concurrency)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            queues: BTreeMap::new(),
            job_registry: JobRegistry::default(),
            context,
            concurrency: DEFAULT_CONCURRENCY,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Register a job type.
    ///
    /// The job's queue is created with default settings if it has not been
    /// configured yet.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        self.queues.entry(J::QUEUE.to_string()).or_default();

        Runner {
            connection_pool: self.connection_pool,
            queues: self.queues,
            job_registry: self.job_registry,
            context: self.context,
            concurrency: self.concurrency,
            retry_base_delay: self.retry_base_delay,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue) -> Queue,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Set the total number of workers shared by all queues.
    ///
    /// Every queue gets at least one worker, so the effective concurrency is
    /// never lower than the number of queues.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the delay before the first retry of a failed job.
    ///
    /// Each further retry waits twice as long as the previous one.
    pub fn retry_base_delay(mut self, retry_base_delay: Duration) -> Self {
        self.retry_base_delay = retry_base_delay;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the workers or
    /// wait for them to shut down.
    pub fn start(&self) -> RunHandle {
        let shutdown = CancellationToken::new();
        let job_registry = Arc::new(self.job_registry.clone());
        let weights = self
            .queues
            .iter()
            .map(|(name, queue)| (name.as_str(), queue.weight))
            .collect::<Vec<_>>();

        let mut handles = Vec::new();
        for (queue_name, num_workers) in apportion(self.concurrency, &weights) {
            let queue = &self.queues[queue_name];
            for i in 1..=num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    connection_pool: self.connection_pool.clone(),
                    context: self.context.clone(),
                    job_registry: job_registry.clone(),
                    queue_name: queue_name.to_string(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                    retry_base_delay: self.retry_base_delay,
                    shutdown: shutdown.clone(),
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        RunHandle { handles, shutdown }
    }
}

/// Splits `concurrency` workers between queues in proportion to their weights.
///
/// Uses the largest-remainder method. Every queue gets at least one worker,
/// so the total is `max(concurrency, weights.len())`.
pub(crate) fn apportion<'a>(concurrency: usize, weights: &[(&'a str, u32)]) -> Vec<(&'a str, usize)> {
    if weights.is_empty() {
        return Vec::new();
    }

    let budget = concurrency.max(weights.len());
    let total_weight: u64 = weights.iter().map(|(_, w)| u64::from((*w).max(1))).sum();

    let mut shares = weights
        .iter()
        .map(|(name, weight)| {
            let exact = budget as u64 * u64::from((*weight).max(1));
            let whole = usize::try_from(exact / total_weight).unwrap_or(budget);
            (*name, whole.max(1), exact % total_weight)
        })
        .collect::<Vec<_>>();

    let mut assigned: usize = shares.iter().map(|(_, n, _)| n).sum();

    let mut by_remainder = (0..shares.len()).collect::<Vec<_>>();
    by_remainder.sort_by(|a, b| shares[*b].2.cmp(&shares[*a].2).then(a.cmp(b)));
    for index in by_remainder {
        if assigned >= budget {
            break;
        }
        shares[index].1 += 1;
        assigned += 1;
    }

    // Minimum shares can push the total over budget; take from the largest
    while assigned > budget {
        let Some(largest) = shares
            .iter_mut()
            .filter(|(_, n, _)| *n > 1)
            .max_by_key(|(_, n, _)| *n)
        else {
            break;
        };
        largest.1 -= 1;
        assigned -= 1;
    }

    shares.into_iter().map(|(name, n, _)| (name, n)).collect()
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Stop picking up new jobs and wait for running jobs to finish.
    ///
    /// Workers that are still busy after `grace_period` are aborted, which
    /// rolls back their job transaction so the job is delivered again later.
    /// Returns `true` if every worker stopped within the grace period.
    pub async fn shutdown(self, grace_period: Duration) -> bool {
        info!(workers = self.handles.len(), "Stopping background workers…");
        self.shutdown.cancel();

        let abort_handles = self
            .handles
            .iter()
            .map(JoinHandle::abort_handle)
            .collect::<Vec<_>>();

        match tokio::time::timeout(grace_period, self.wait_for_shutdown()).await {
            Ok(()) => {
                info!("All background workers stopped");
                true
            }
            Err(_) => {
                warn!(?grace_period, "Background workers did not stop in time, aborting them");
                abort_handles.iter().for_each(|handle| handle.abort());
                false
            }
        }
    }
}

/// Configuration for a job queue
#[derive(Debug, Clone)]
pub struct Queue {
    weight: u32,
    poll_interval: Duration,
    jitter: Duration,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            weight: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Queue {
    /// Set the relative share of the runner's concurrency this queue gets.
    ///
    /// A weight of zero is treated as one.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}
