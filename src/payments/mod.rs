//! The payment lifecycle: domain model, storage, gateway clients and the
//! background jobs that move payments from `pending` to a terminal status.

mod gateway;
mod in_memory;
mod jobs;
mod model;
mod service;
mod store;
mod worker;

pub use self::gateway::{
    GatewayError, HttpGateway, PaymentGateway, SimulatedGateway, SimulationPolicy,
};
pub use self::in_memory::InMemoryPaymentStore;
pub use self::jobs::{
    CRITICAL_QUEUE, CheckPaymentStatusJob, ProcessPaymentJob, TYPE_CHECK_PAYMENT_STATUS,
    TYPE_PROCESS_PAYMENT,
};
pub use self::model::{NewPayment, Payment, PaymentStatus, PaymentUpdate};
pub use self::service::{PaymentError, PaymentService};
pub use self::store::PgPaymentStore;
pub use self::worker::{PaymentTaskError, PaymentWorker, Processing, StatusCheck, WorkerConfig};
