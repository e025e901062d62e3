//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the task queue tables.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Represents a queued task record in the database
#[derive(Debug, Clone, FromRow)]
pub struct BackgroundJob {
    /// Unique identifier for the job
    pub id: i64,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// JSON data containing the job payload
    pub data: Value,
    /// Name of the queue (priority lane) the job was submitted to
    pub queue: String,
    /// Priority of the job within its queue (higher = more important)
    pub priority: i16,
    /// Earliest time at which the job may be delivered
    pub run_at: DateTime<Utc>,
    /// Number of failed attempts so far
    pub retries: i32,
    /// Number of retries allowed before the job is dead-lettered
    pub max_retries: i32,
    /// Timestamp of the last failed attempt
    pub last_retry: DateTime<Utc>,
    /// Error message of the last failed attempt
    pub last_error: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
}

/// Represents a job that exhausted its retry budget
#[derive(Debug, Clone, FromRow)]
pub struct DeadJob {
    /// The original background job data
    #[sqlx(flatten)]
    pub job: BackgroundJob,
    /// Timestamp when the job was moved to the dead-letter table
    pub failed_at: DateTime<Utc>,
}
