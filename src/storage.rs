use crate::schema::{BackgroundJob, DeadJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

const JOB_COLUMNS: &str = "id, job_type, data, queue, priority, run_at, retries, max_retries, last_retry, last_error, created_at";

/// Column values of a job that is about to be inserted.
pub(crate) struct InsertJob<'a> {
    pub(crate) job_type: &'a str,
    pub(crate) data: Value,
    pub(crate) queue: &'a str,
    pub(crate) priority: i16,
    pub(crate) run_at: DateTime<Utc>,
    pub(crate) max_retries: i32,
}

/// Inserts a new job and returns its id.
pub(crate) async fn insert_job(pool: &PgPool, job: InsertJob<'_>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_type, data, queue, priority, run_at, max_retries)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(job.data)
    .bind(job.queue)
    .bind(job.priority)
    .bind(job.run_at)
    .bind(job.max_retries)
    .fetch_one(pool)
    .await
}

/// Inserts a job unless an unlocked job with the same type, data and queue
/// already exists.
///
/// Returns the id of the inserted job, or of the existing one, and whether a
/// row was inserted. Jobs that are currently running hold a row lock and are
/// skipped, so a job can enqueue its own successor.
pub(crate) async fn insert_job_deduplicated(
    pool: &PgPool,
    job: InsertJob<'_>,
) -> Result<(i64, bool), sqlx::Error> {
    sqlx::query_as::<_, (i64, bool)>(
        r"
        WITH existing AS (
            SELECT id FROM background_jobs
            WHERE job_type = $1 AND data = $2 AND queue = $3
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        ), inserted AS (
            INSERT INTO background_jobs (job_type, data, queue, priority, run_at, max_retries)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM existing)
            RETURNING id
        )
        SELECT id, true FROM inserted
        UNION ALL
        SELECT id, false FROM existing
        ",
    )
    .bind(job.job_type)
    .bind(job.data)
    .bind(job.queue)
    .bind(job.priority)
    .bind(job.run_at)
    .bind(job.max_retries)
    .fetch_one(pool)
    .await
}

/// The number of jobs that have failed at least once
pub async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs WHERE retries > 0")
        .fetch_one(pool)
        .await
}

/// Finds the next job of `queue` that is unlocked, due, and ready to be retried.
///
/// A job that failed `n` times becomes eligible again once
/// `retry_base_delay * 2^(n - 1)` has passed since its last failure.
pub(crate) async fn find_next_unlocked_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    job_types: &[String],
    retry_base_delay: Duration,
) -> Result<BackgroundJob, sqlx::Error> {
    let base_delay_ms = i64::try_from(retry_base_delay.as_millis()).unwrap_or(i64::MAX);

    sqlx::query_as::<_, BackgroundJob>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM background_jobs
        WHERE queue = $1
          AND job_type = ANY($2)
          AND run_at <= NOW()
          AND (
            retries = 0
            OR last_retry < NOW() - INTERVAL '1 millisecond' * ($3::BIGINT * POWER(2, retries - 1))
          )
        ORDER BY priority DESC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "
    ))
    .bind(queue)
    .bind(job_types)
    .bind(base_delay_ms)
    .fetch_one(&mut **tx)
    .await
}

/// Deletes a job that has successfully completed running
pub(crate) async fn delete_successful_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Marks that we just tried and failed to run a job.
pub(crate) async fn update_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE background_jobs SET retries = retries + 1, last_retry = NOW(), last_error = $2 WHERE id = $1",
    )
    .bind(job_id)
    .bind(error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Moves a job that exhausted its retries to the `dead_jobs` table.
///
/// The retry counter includes the attempt that just failed.
pub(crate) async fn dead_letter_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO dead_jobs (id, job_type, data, queue, priority, run_at, retries, max_retries, last_retry, last_error, created_at)
        SELECT id, job_type, data, queue, priority, run_at, retries + 1, max_retries, NOW(), $2, created_at
        FROM background_jobs
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(error)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Get dead-lettered jobs, newest first, optionally filtered by job type
pub async fn get_dead_jobs(
    pool: &PgPool,
    job_type: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<DeadJob>, sqlx::Error> {
    let mut query = format!("SELECT {JOB_COLUMNS}, failed_at FROM dead_jobs");

    if job_type.is_some() {
        query.push_str(" WHERE job_type = $1");
    }

    query.push_str(" ORDER BY failed_at DESC, id DESC");

    if limit.is_some() {
        if job_type.is_some() {
            query.push_str(" LIMIT $2");
        } else {
            query.push_str(" LIMIT $1");
        }
    }

    let mut query_builder = sqlx::query_as::<_, DeadJob>(&query);

    if let Some(job_type_val) = job_type {
        query_builder = query_builder.bind(job_type_val);
    }

    if let Some(limit_val) = limit {
        query_builder = query_builder.bind(limit_val);
    }

    query_builder.fetch_all(pool).await
}

/// Get count of dead-lettered jobs
pub async fn dead_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_jobs")
        .fetch_one(pool)
        .await
}
