#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
pub mod config;
mod errors;
mod job_registry;
pub mod payments;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod task_queue;
pub mod telemetry;
mod util;
mod worker;

use sqlx::PgPool;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE, EnqueueOptions};
/// Errors of job submission and payload decoding.
pub use self::errors::{DecodeError, EnqueueError};
/// The main runner that orchestrates job processing.
pub use self::runner::{Queue, RunHandle, Runner};
/// Inspection of failed and dead-lettered jobs.
pub use self::storage::{dead_job_count, failed_job_count, get_dead_jobs};
/// The task submission boundary.
pub use self::task_queue::{NewTask, PgTaskQueue, TaskHandle, TaskQueue};

/// Creates or upgrades the job queue and payment tables.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
