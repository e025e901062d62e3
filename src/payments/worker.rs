use super::gateway::{GatewayError, PaymentGateway};
use super::jobs::{CheckPaymentStatusJob, ProcessPaymentJob};
use super::model::{Payment, PaymentStatus, PaymentUpdate};
use super::service::{PaymentError, PaymentService};
use crate::background_job::{BackgroundJob, DEFAULT_MAX_RETRIES, EnqueueOptions};
use crate::errors::EnqueueError;
use crate::task_queue::{TaskHandle, TaskQueue};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Settings of the payment lifecycle worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay between two status checks of a pending payment.
    pub payment_check_interval: Duration,
    /// Retry budget of every task the worker submits.
    pub retry_max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            payment_check_interval: Duration::from_secs(5 * 60),
            retry_max_attempts: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Errors that fail a lifecycle task and hand it back to the queue for redelivery.
#[derive(Debug, Error)]
pub enum PaymentTaskError {
    /// The payment could not be loaded.
    #[error("failed to get payment {payment_id}: {source}")]
    Fetch {
        /// The payment the task was about.
        payment_id: u64,
        /// What the store reported.
        #[source]
        source: PaymentError,
    },

    /// The gateway could not be asked.
    #[error("gateway call for payment {payment_id} failed: {source}")]
    Gateway {
        /// The payment the task was about.
        payment_id: u64,
        /// What the gateway client reported.
        #[source]
        source: GatewayError,
    },

    /// The new status could not be stored.
    #[error("failed to update payment {payment_id} to {status}: {source}")]
    Update {
        /// The payment the task was about.
        payment_id: u64,
        /// The status that was being written.
        status: PaymentStatus,
        /// What the store reported.
        #[source]
        source: PaymentError,
    },
}

/// Result of a successful status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCheck {
    /// The payment was already terminal. Nothing was written or scheduled.
    Skipped(PaymentStatus),
    /// The payment reached a terminal status, which was stored.
    Settled(PaymentStatus),
    /// The payment is still pending. `follow_up` is the next check, or
    /// `None` if it could not be scheduled.
    StillPending {
        /// Handle of the follow-up status check.
        follow_up: Option<TaskHandle>,
    },
}

/// Result of a successful processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processing {
    /// The payment was already terminal and was left alone.
    Skipped(PaymentStatus),
    /// The gateway settled the payment with this status, which was stored.
    Processed(PaymentStatus),
}

/// Drives payments from `pending` to a terminal status.
///
/// All collaborators are injected. The worker keeps no payment state between
/// tasks: every handler starts by fetching the payment again, so a redelivered
/// task always acts on what is currently stored.
#[derive(Clone)]
pub struct PaymentWorker {
    payments: Arc<dyn PaymentService>,
    queue: Arc<dyn TaskQueue>,
    gateway: Arc<dyn PaymentGateway>,
    config: WorkerConfig,
}

impl std::fmt::Debug for PaymentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PaymentWorker {
    /// Creates a worker from its collaborators.
    pub fn new(
        payments: Arc<dyn PaymentService>,
        queue: Arc<dyn TaskQueue>,
        gateway: Arc<dyn PaymentGateway>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            payments,
            queue,
            gateway,
            config,
        }
    }

    /// Handles a status-check task.
    ///
    /// A pending payment is checked against the gateway. If it is still
    /// pending afterwards, the next check is scheduled; failing to schedule it
    /// is logged but does not fail this task, whose own work is done.
    #[instrument(skip(self), fields(task = CheckPaymentStatusJob::JOB_TYPE))]
    pub async fn check_payment_status(&self, payment_id: u64) -> Result<StatusCheck, PaymentTaskError> {
        info!("Processing payment status check");

        let payment = self.fetch(payment_id).await?;
        if payment.status.is_terminal() {
            info!(status = %payment.status, "Payment already in final state, skipping check");
            return Ok(StatusCheck::Skipped(payment.status));
        }

        let resolved = self
            .gateway
            .check_status(&payment)
            .await
            .map_err(|source| PaymentTaskError::Gateway { payment_id, source })?;

        if resolved != payment.status {
            let description = format!("Status updated by worker at {}", now_rfc3339());
            self.persist(&payment, resolved, description).await?;
        }

        if resolved.is_terminal() {
            return Ok(StatusCheck::Settled(resolved));
        }

        let follow_up = match self
            .schedule_status_check(payment_id, self.config.payment_check_interval)
            .await
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                error!(%error, "Failed to schedule next payment status check");
                None
            }
        };

        Ok(StatusCheck::StillPending { follow_up })
    }

    /// Handles a processing task.
    ///
    /// Asks the gateway to settle the payment and stores `completed` or
    /// `failed`. Payments that are already terminal are left alone, which
    /// makes redelivered tasks harmless.
    #[instrument(skip(self), fields(task = ProcessPaymentJob::JOB_TYPE))]
    pub async fn process_payment(&self, payment_id: u64) -> Result<Processing, PaymentTaskError> {
        info!("Processing payment");

        let payment = self.fetch(payment_id).await?;
        if payment.status.is_terminal() {
            info!(status = %payment.status, "Payment already in final state, skipping processing");
            return Ok(Processing::Skipped(payment.status));
        }

        let success = self
            .gateway
            .process(&payment)
            .await
            .map_err(|source| PaymentTaskError::Gateway { payment_id, source })?;

        let status = if success {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };

        let description = format!("Payment processed by worker at {}", now_rfc3339());
        self.persist(&payment, status, description).await?;

        info!(final_status = %status, success, "Payment processing completed");
        Ok(Processing::Processed(status))
    }

    /// Schedules a status check of `payment_id` on the default queue after `delay`.
    pub async fn schedule_status_check(
        &self,
        payment_id: u64,
        delay: Duration,
    ) -> Result<TaskHandle, EnqueueError> {
        let options = EnqueueOptions::default()
            .delay(delay)
            .max_retries(self.config.retry_max_attempts);

        let handle = CheckPaymentStatusJob { payment_id }
            .enqueue_with(self.queue.as_ref(), options)
            .await?;

        info!(payment_id, ?delay, task.id = handle.id, "Scheduled payment status check");
        Ok(handle)
    }

    /// Schedules immediate processing of `payment_id` on the critical queue.
    pub async fn schedule_processing(&self, payment_id: u64) -> Result<TaskHandle, EnqueueError> {
        let options = EnqueueOptions::default().max_retries(self.config.retry_max_attempts);

        let handle = ProcessPaymentJob { payment_id }
            .enqueue_with(self.queue.as_ref(), options)
            .await?;

        info!(payment_id, task.id = handle.id, "Scheduled payment processing");
        Ok(handle)
    }

    async fn fetch(&self, payment_id: u64) -> Result<Payment, PaymentTaskError> {
        self.payments.get(payment_id).await.map_err(|source| {
            error!(error = %source, "Failed to get payment");
            PaymentTaskError::Fetch { payment_id, source }
        })
    }

    async fn persist(
        &self,
        payment: &Payment,
        status: PaymentStatus,
        description: String,
    ) -> Result<Payment, PaymentTaskError> {
        let update = PaymentUpdate {
            status,
            description: Some(description),
        };

        match self.payments.update(payment.id, update).await {
            Ok(updated) => {
                info!(old_status = %payment.status, new_status = %status, "Payment status updated");
                Ok(updated)
            }
            Err(source) => {
                if source.is_validation() {
                    // Statuses come from a closed enum, so the store disagrees with us about it
                    warn!(
                        alert = "payment_status_contract_drift",
                        new_status = %status,
                        error = %source,
                        "Payment store rejected a status produced by the worker"
                    );
                } else {
                    error!(new_status = %status, error = %source, "Failed to update payment status");
                }
                Err(PaymentTaskError::Update {
                    payment_id: payment.id,
                    status,
                    source,
                })
            }
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
