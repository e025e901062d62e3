use super::model::{NewPayment, Payment, PaymentStatus, PaymentUpdate};
use super::service::{PaymentError, PaymentService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

const PAYMENT_COLUMNS: &str =
    "id, amount, currency, status, description, user_id, created_at, updated_at";

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: i64,
    amount: Decimal,
    currency: String,
    status: String,
    description: String,
    user_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PaymentError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: to_public_id(row.id)?,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            description: row.description,
            user_id: to_public_id(row.user_id)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_public_id(id: i64) -> Result<u64, PaymentError> {
    u64::try_from(id).map_err(|_| PaymentError::Validation(format!("negative id {id}")))
}

/// [`PaymentService`] backed by the `payments` table.
#[derive(Debug, Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    /// Creates a store on top of an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a new `pending` payment.
    pub async fn create(&self, payment: NewPayment) -> Result<Payment, PaymentError> {
        payment.validate()?;
        let user_id = i64::try_from(payment.user_id)
            .map_err(|_| PaymentError::Validation(format!("user id {} out of range", payment.user_id)))?;

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r"
            INSERT INTO payments (amount, currency, status, description, user_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(payment.amount)
        .bind(payment.currency)
        .bind(PaymentStatus::Pending.as_str())
        .bind(payment.description)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl PaymentService for PgPaymentStore {
    async fn get(&self, id: u64) -> Result<Payment, PaymentError> {
        let db_id = i64::try_from(id).map_err(|_| PaymentError::NotFound(id))?;

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(db_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::NotFound(id))?;

        row.try_into()
    }

    async fn update(&self, id: u64, update: PaymentUpdate) -> Result<Payment, PaymentError> {
        let db_id = i64::try_from(id).map_err(|_| PaymentError::NotFound(id))?;

        // An empty description leaves the current one in place
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r"
            UPDATE payments
            SET status = $2,
                description = COALESCE(NULLIF($3, ''), description),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(db_id)
        .bind(update.status.as_str())
        .bind(update.description)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::NotFound(id))?;

        row.try_into()
    }
}
