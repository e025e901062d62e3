use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::service::PaymentError;

/// Lifecycle status of a payment.
///
/// `Pending` is the only non-terminal status. Once a payment is completed,
/// failed or canceled the lifecycle worker leaves it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Waiting for the gateway to settle.
    Pending,
    /// Settled successfully.
    Completed,
    /// Rejected by the gateway.
    Failed,
    /// Canceled before settlement.
    Canceled,
}

impl PaymentStatus {
    /// All statuses, in declaration order.
    pub const ALL: [PaymentStatus; 4] = [
        PaymentStatus::Pending,
        PaymentStatus::Completed,
        PaymentStatus::Failed,
        PaymentStatus::Canceled,
    ];

    /// The wire and database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    /// Whether no further automatic transition can leave this status.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PaymentError::InvalidStatus(s.to_string()))
    }
}

/// A payment as seen through the payment service boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Unique identifier.
    pub id: u64,
    /// Positive amount in `currency`.
    pub amount: Decimal,
    /// ISO 4217 code, three letters.
    pub currency: String,
    /// Current lifecycle status.
    pub status: PaymentStatus,
    /// Free text, rewritten with an audit note on automatic transitions.
    pub description: String,
    /// Owner of the payment. Not validated by the worker.
    pub user_id: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

/// Changes applied by [`PaymentService::update`](super::PaymentService::update).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    /// The new status.
    pub status: PaymentStatus,
    /// Replaces the description when set.
    pub description: Option<String>,
}

/// Data for a payment that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    /// Must be positive.
    pub amount: Decimal,
    /// ISO 4217 code, three letters.
    pub currency: String,
    /// Free text.
    pub description: String,
    /// Owner of the payment.
    pub user_id: u64,
}

impl NewPayment {
    /// Checks the invariants the payments table relies on.
    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::Validation(format!(
                "currency must be a three-letter code, got {:?}",
                self.currency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_round_trips_through_strings() {
        for status in PaymentStatus::ALL {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_a_validation_error() {
        let err = "refunded".parse::<PaymentStatus>().unwrap_err();
        assert!(matches!(err, PaymentError::InvalidStatus(ref s) if s == "refunded"));

        // Case matters, the stored values are lowercase
        assert!("Pending".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn only_pending_is_not_terminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&PaymentStatus::Canceled).unwrap();
        assert_eq!(json, r#""canceled""#);
        assert!(serde_json::from_str::<PaymentStatus>(r#""bogus""#).is_err());
    }

    #[test]
    fn new_payment_validation() {
        let mut payment = NewPayment {
            amount: dec!(10.50),
            currency: "USD".into(),
            description: "coffee".into(),
            user_id: 1,
        };
        assert!(payment.validate().is_ok());

        payment.amount = dec!(0);
        assert!(matches!(payment.validate(), Err(PaymentError::Validation(_))));

        payment.amount = dec!(1);
        payment.currency = "US".into();
        assert!(matches!(payment.validate(), Err(PaymentError::Validation(_))));
    }
}
