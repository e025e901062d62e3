use super::worker::PaymentWorker;
use crate::background_job::{BackgroundJob, DEFAULT_QUEUE};
use serde::{Deserialize, Serialize};

/// Task type of periodic payment status checks.
pub const TYPE_CHECK_PAYMENT_STATUS: &str = "payment:check_status";

/// Task type of one-shot payment processing.
pub const TYPE_PROCESS_PAYMENT: &str = "payment:process";

/// Queue for latency-sensitive work.
pub const CRITICAL_QUEUE: &str = "critical";

/// Low-urgency status check, rescheduled until the payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPaymentStatusJob {
    /// The payment to check.
    pub payment_id: u64,
}

impl BackgroundJob for CheckPaymentStatusJob {
    const JOB_TYPE: &'static str = TYPE_CHECK_PAYMENT_STATUS;
    const QUEUE: &'static str = DEFAULT_QUEUE;
    const DEDUPLICATED: bool = true;
    type Context = PaymentWorker;

    async fn run(&self, worker: Self::Context) -> anyhow::Result<()> {
        worker.check_payment_status(self.payment_id).await?;
        Ok(())
    }
}

/// Urgent, one-shot processing of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPaymentJob {
    /// The payment to process.
    pub payment_id: u64,
}

impl BackgroundJob for ProcessPaymentJob {
    const JOB_TYPE: &'static str = TYPE_PROCESS_PAYMENT;
    const QUEUE: &'static str = CRITICAL_QUEUE;
    type Context = PaymentWorker;

    async fn run(&self, worker: Self::Context) -> anyhow::Result<()> {
        worker.process_payment(self.payment_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DecodeError, EnqueueError};
    use crate::job_registry::JobRegistry;
    use crate::payments::gateway::SimulatedGateway;
    use crate::payments::model::{Payment, PaymentUpdate};
    use crate::payments::service::{PaymentError, PaymentService};
    use crate::payments::worker::WorkerConfig;
    use crate::task_queue::{NewTask, TaskHandle, TaskQueue};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentService for CountingStore {
        async fn get(&self, id: u64) -> Result<Payment, PaymentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PaymentError::NotFound(id))
        }

        async fn update(&self, id: u64, _update: PaymentUpdate) -> Result<Payment, PaymentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PaymentError::NotFound(id))
        }
    }

    struct NoQueue;

    #[async_trait]
    impl TaskQueue for NoQueue {
        async fn enqueue(&self, _task: NewTask) -> Result<TaskHandle, EnqueueError> {
            Err(EnqueueError::Rejected("not in this test".into()))
        }
    }

    fn registry_and_store() -> (JobRegistry<PaymentWorker>, PaymentWorker, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        let worker = PaymentWorker::new(
            store.clone(),
            Arc::new(NoQueue),
            Arc::new(SimulatedGateway::default()),
            WorkerConfig::default(),
        );

        let mut registry = JobRegistry::default();
        registry.register::<CheckPaymentStatusJob>();
        registry.register::<ProcessPaymentJob>();

        (registry, worker, store)
    }

    #[test]
    fn payload_wire_format() {
        let payload = serde_json::to_value(CheckPaymentStatusJob { payment_id: 7 }).unwrap();
        insta::assert_compact_json_snapshot!(payload, @r#"{"payment_id": 7}"#);

        let payload = serde_json::to_value(ProcessPaymentJob { payment_id: 9 }).unwrap();
        insta::assert_compact_json_snapshot!(payload, @r#"{"payment_id": 9}"#);
    }

    #[tokio::test]
    async fn malformed_payloads_fail_before_touching_the_store() {
        let (registry, worker, store) = registry_and_store();

        let payloads = [
            json!({"payment_id": "abc"}),
            json!({"payment_id": -1}),
            json!({"id": 1}),
            json!("payment_id"),
        ];

        for job_type in [TYPE_CHECK_PAYMENT_STATUS, TYPE_PROCESS_PAYMENT] {
            let run = registry.get(job_type).unwrap();
            for payload in &payloads {
                let error = run(worker.clone(), payload.clone()).await.unwrap_err();
                let decode = error.downcast_ref::<DecodeError>().unwrap();
                assert_eq!(decode.job_type, job_type);
            }
        }

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn well_formed_payloads_reach_the_store() {
        let (registry, worker, store) = registry_and_store();

        let run = registry.get(TYPE_CHECK_PAYMENT_STATUS).unwrap();
        let error = run(worker, json!({"payment_id": 3})).await.unwrap_err();

        assert!(error.downcast_ref::<DecodeError>().is_none());
        assert_eq!(error.to_string(), "failed to get payment 3: payment 3 not found");
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
