//! The task submission boundary.
//!
//! Producers never talk to the queue tables directly. They hand a [`NewTask`]
//! to a [`TaskQueue`], which lets the lifecycle worker be tested against a
//! recording queue and run in production against [`PgTaskQueue`].

use crate::errors::EnqueueError;
use crate::storage::{self, InsertJob};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

/// A task ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Routing key; must match a registered job type on the consumer side.
    pub job_type: String,
    /// Serialized payload.
    pub payload: Value,
    /// Target queue (priority lane).
    pub queue: String,
    /// Ordering hint inside the queue.
    pub priority: i16,
    /// How long to wait before the task becomes deliverable.
    pub delay: Duration,
    /// Retries allowed before the task is dead-lettered.
    pub max_retries: i32,
    /// Reuse an unstarted task with the same type, payload and queue instead
    /// of submitting a second one.
    pub deduplicated: bool,
}

/// Identifies a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// Queue-assigned identifier.
    pub id: i64,
    /// The queue the task was submitted to.
    pub queue: String,
}

/// Anything that accepts tasks for asynchronous delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submits a task, returning its handle.
    async fn enqueue(&self, task: NewTask) -> Result<TaskHandle, EnqueueError>;
}

/// [`TaskQueue`] backed by the `background_jobs` table.
#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    /// Creates a queue client on top of an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<TaskHandle, EnqueueError> {
        let delay = chrono::Duration::from_std(task.delay)
            .map_err(|_| EnqueueError::InvalidDelay(task.delay))?;
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or(EnqueueError::InvalidDelay(task.delay))?;

        let job = InsertJob {
            job_type: &task.job_type,
            data: task.payload,
            queue: &task.queue,
            priority: task.priority,
            run_at,
            max_retries: task.max_retries,
        };

        let id = if task.deduplicated {
            let (id, inserted) = storage::insert_job_deduplicated(&self.pool, job).await?;
            if !inserted {
                debug!(job.id = id, job.type = %task.job_type, queue = %task.queue, "Task already pending, not enqueued again");
                return Ok(TaskHandle {
                    id,
                    queue: task.queue,
                });
            }
            id
        } else {
            storage::insert_job(&self.pool, job).await?
        };

        debug!(job.id = id, job.type = %task.job_type, queue = %task.queue, "Task enqueued");

        Ok(TaskHandle {
            id,
            queue: task.queue,
        })
    }
}
