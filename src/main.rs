use anyhow::Context;
use clap::Parser;
use payment_workers::config::{CliArgs, Config, GatewayConfig};
use payment_workers::payments::{
    CheckPaymentStatusJob, HttpGateway, PaymentGateway, PaymentWorker, PgPaymentStore,
    ProcessPaymentJob, SimulatedGateway,
};
use payment_workers::telemetry::init_telemetry;
use payment_workers::{PgTaskQueue, Runner, setup_database};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = Config::try_from(args)?;

    init_telemetry(config.log_format)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;

    setup_database(&pool)
        .await
        .context("failed to run database migrations")?;

    let gateway: Arc<dyn PaymentGateway> = match &config.gateway {
        GatewayConfig::Http { url, timeout } => {
            info!(gateway.url = %url, "Using HTTP payment gateway");
            Arc::new(HttpGateway::new(url.as_str(), *timeout)?)
        }
        GatewayConfig::Simulated(policy) => {
            warn!(?policy, "No PAYMENT_GATEWAY_URL set, payments are settled by simulation");
            Arc::new(SimulatedGateway::new(*policy))
        }
    };

    let worker = PaymentWorker::new(
        Arc::new(PgPaymentStore::new(pool.clone())),
        Arc::new(PgTaskQueue::new(pool.clone())),
        gateway,
        config.worker,
    );

    let mut runner = Runner::new(pool, worker)
        .register::<CheckPaymentStatusJob>()
        .register::<ProcessPaymentJob>()
        .concurrency(config.concurrency)
        .retry_base_delay(config.retry_base_delay);

    for queue in &config.queues {
        runner = runner.configure_queue(&queue.name, |q| {
            q.weight(queue.weight)
                .poll_interval(config.poll_interval)
                .jitter(config.poll_jitter)
        });
    }

    info!(
        concurrency = config.concurrency,
        max_connections = config.max_connections,
        queues = ?config.queues,
        retry_max_attempts = config.worker.retry_max_attempts,
        "Starting payment worker"
    );

    let handle = runner.start();

    shutdown_signal().await;

    if !handle.shutdown(config.shutdown_timeout).await {
        warn!("Some jobs were interrupted and will be delivered again");
    }

    info!("Payment worker shut down");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }

    info!("Shutdown signal received, draining running jobs...");
}
