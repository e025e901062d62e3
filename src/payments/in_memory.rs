use super::model::{NewPayment, Payment, PaymentStatus, PaymentUpdate};
use super::service::{PaymentError, PaymentService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory payment store.
///
/// Behaves like [`PgPaymentStore`](super::PgPaymentStore) without a database.
/// Useful for tests and local experiments with the lifecycle worker.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPaymentStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    payments: HashMap<u64, Payment>,
    next_id: u64,
}

impl InMemoryPaymentStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a `pending` payment created at `created_at`.
    pub async fn create_at(
        &self,
        payment: NewPayment,
        created_at: DateTime<Utc>,
    ) -> Result<Payment, PaymentError> {
        payment.validate()?;

        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let payment = Payment {
            id: inner.next_id,
            amount: payment.amount,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            description: payment.description,
            user_id: payment.user_id,
            created_at,
            updated_at: created_at,
        };
        inner.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    /// Stores `payment` as is, replacing any payment with the same id.
    pub async fn insert(&self, payment: Payment) {
        let mut inner = self.inner.write().await;
        inner.next_id = inner.next_id.max(payment.id);
        inner.payments.insert(payment.id, payment);
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentStore {
    async fn get(&self, id: u64) -> Result<Payment, PaymentError> {
        let inner = self.inner.read().await;
        inner
            .payments
            .get(&id)
            .cloned()
            .ok_or(PaymentError::NotFound(id))
    }

    async fn update(&self, id: u64, update: PaymentUpdate) -> Result<Payment, PaymentError> {
        let mut inner = self.inner.write().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or(PaymentError::NotFound(id))?;

        payment.status = update.status;
        if let Some(description) = update.description.filter(|d| !d.is_empty()) {
            payment.description = description;
        }
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_payment() -> NewPayment {
        NewPayment {
            amount: dec!(25.00),
            currency: "EUR".into(),
            description: "order #1".into(),
            user_id: 42,
        }
    }

    #[tokio::test]
    async fn create_get_update() {
        let store = InMemoryPaymentStore::new();
        let created = store.create_at(new_payment(), Utc::now()).await.unwrap();
        assert_eq!(created.id, 1);
        assert_eq!(created.status, PaymentStatus::Pending);

        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched, created);

        let updated = store
            .update(
                created.id,
                PaymentUpdate {
                    status: PaymentStatus::Completed,
                    description: Some("settled".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PaymentStatus::Completed);
        assert_eq!(updated.description, "settled");
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn empty_description_keeps_the_old_one() {
        let store = InMemoryPaymentStore::new();
        let created = store.create_at(new_payment(), Utc::now()).await.unwrap();

        let updated = store
            .update(
                created.id,
                PaymentUpdate {
                    status: PaymentStatus::Canceled,
                    description: Some(String::new()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "order #1");
    }

    #[tokio::test]
    async fn missing_payment_is_not_found() {
        let store = InMemoryPaymentStore::new();
        assert!(matches!(store.get(9).await, Err(PaymentError::NotFound(9))));

        let update = PaymentUpdate {
            status: PaymentStatus::Failed,
            description: None,
        };
        assert!(matches!(
            store.update(9, update).await,
            Err(PaymentError::NotFound(9))
        ));
    }

    #[tokio::test]
    async fn invalid_payments_are_rejected() {
        let store = InMemoryPaymentStore::new();
        let mut payment = new_payment();
        payment.amount = dec!(-1);
        assert!(matches!(
            store.create_at(payment, Utc::now()).await,
            Err(PaymentError::Validation(_))
        ));
    }
}
