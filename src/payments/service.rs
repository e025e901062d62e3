use super::model::{Payment, PaymentUpdate};
use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by the payment service boundary.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// No payment with this id exists (yet).
    #[error("payment {0} not found")]
    NotFound(u64),

    /// A status string outside the closed set of payment statuses.
    #[error("invalid payment status {0:?}")]
    InvalidStatus(String),

    /// Any other rejected input.
    #[error("invalid payment: {0}")]
    Validation(String),

    /// The backing store failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl PaymentError {
    /// Whether the store rejected the request itself rather than failing to
    /// serve it.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PaymentError::InvalidStatus(_) | PaymentError::Validation(_)
        )
    }
}

/// Lookup and update of payments, as consumed by the lifecycle worker.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Fetches the current state of a payment.
    async fn get(&self, id: u64) -> Result<Payment, PaymentError>;

    /// Applies `update` and refreshes the payment's `updated_at`.
    async fn update(&self, id: u64, update: PaymentUpdate) -> Result<Payment, PaymentError>;
}
