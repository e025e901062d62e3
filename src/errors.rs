use thiserror::Error;

/// Errors that can occur while submitting a task to the queue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// An error occurred while serializing the job payload.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// A database error occurred while inserting the task.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// The delay does not fit into the range the queue backend accepts.
    #[error("delay of {0:?} is out of range")]
    InvalidDelay(std::time::Duration),

    /// The queue backend refused the task for another reason.
    #[error("task submission rejected: {0}")]
    Rejected(String),
}

/// A task payload could not be decoded into its job type.
///
/// The attempt fails like any other handler error, so the task is retried and
/// eventually dead-lettered.
#[derive(Debug, Error)]
#[error("failed to decode payload of `{job_type}` job: {source}")]
pub struct DecodeError {
    /// The job type the payload was addressed to.
    pub job_type: &'static str,
    /// The underlying deserialization failure.
    #[source]
    pub source: serde_json::Error,
}
