//! Runtime configuration of the `payment-worker` binary.

use crate::background_job::DEFAULT_QUEUE;
use crate::payments::{CRITICAL_QUEUE, SimulationPolicy, WorkerConfig};
use crate::telemetry::LogFormat;
use clap::Parser;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Command line and environment settings of the `payment-worker` binary.
///
/// Every flag can also be set through the environment variable named next to
/// it; a `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "payment-worker",
    version,
    about = "Background worker that settles pending payments"
)]
pub struct CliArgs {
    /// Postgres connection string for the job queue and payment tables.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Size of the database connection pool.
    ///
    /// Every busy worker holds one connection for the duration of its job and
    /// needs a second one to read and update the payment. Defaults to two
    /// connections per worker; smaller pools are rejected.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Total number of jobs processed at the same time, across all queues.
    ///
    /// Environment variable: `WORKER_CONCURRENCY`
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    /// Queues to consume, as `name=weight`. Workers are split between the
    /// queues in proportion to their weights.
    ///
    /// Environment variable: `WORKER_QUEUES` (comma separated)
    #[arg(
        long = "queue",
        env = "WORKER_QUEUES",
        value_delimiter = ',',
        default_values = ["critical=6", "default=3", "low=1"]
    )]
    pub queues: Vec<QueueWeight>,

    /// Milliseconds an idle worker waits before polling its queue again.
    ///
    /// Environment variable: `WORKER_POLL_INTERVAL_MS`
    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Upper bound of the random delay added to every poll, in milliseconds.
    ///
    /// Environment variable: `WORKER_POLL_JITTER_MS`
    #[arg(long, env = "WORKER_POLL_JITTER_MS", default_value_t = 100)]
    pub poll_jitter_ms: u64,

    /// Seconds between two status checks of a pending payment.
    ///
    /// Environment variable: `PAYMENT_CHECK_INTERVAL_SECS`
    #[arg(long, env = "PAYMENT_CHECK_INTERVAL_SECS", default_value_t = 300)]
    pub payment_check_interval_secs: u64,

    /// Retries of a failed task before it is dead-lettered.
    ///
    /// Environment variable: `RETRY_MAX_ATTEMPTS`
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: i32,

    /// Seconds before the first retry of a failed task. Every further retry
    /// waits twice as long.
    ///
    /// Environment variable: `RETRY_DELAY_SECS`
    #[arg(long, env = "RETRY_DELAY_SECS", default_value_t = 30)]
    pub retry_delay_secs: u64,

    /// Seconds running jobs get to finish after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Base URL of the payment gateway. Without it, payments are settled by
    /// the built-in simulation.
    ///
    /// Environment variable: `PAYMENT_GATEWAY_URL`
    #[arg(long, env = "PAYMENT_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Request timeout of gateway calls, in seconds.
    ///
    /// Environment variable: `PAYMENT_GATEWAY_TIMEOUT_SECS`
    #[arg(long, env = "PAYMENT_GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    pub gateway_timeout_secs: u64,

    /// Simulation: payments younger than this many seconds stay pending.
    ///
    /// Environment variable: `SIM_AGE_THRESHOLD_SECS`
    #[arg(long, env = "SIM_AGE_THRESHOLD_SECS", default_value_t = 120)]
    pub sim_age_threshold_secs: u64,

    /// Simulation: chance that a status check completes an old payment.
    ///
    /// Environment variable: `SIM_COMPLETE_PROBABILITY`
    #[arg(long, env = "SIM_COMPLETE_PROBABILITY", default_value_t = 0.8)]
    pub sim_complete_probability: f64,

    /// Simulation: chance that a status check fails an old payment.
    ///
    /// Environment variable: `SIM_FAIL_PROBABILITY`
    #[arg(long, env = "SIM_FAIL_PROBABILITY", default_value_t = 0.1)]
    pub sim_fail_probability: f64,

    /// Simulation: chance that processing a payment succeeds.
    ///
    /// Environment variable: `SIM_PROCESS_SUCCESS_PROBABILITY`
    #[arg(long, env = "SIM_PROCESS_SUCCESS_PROBABILITY", default_value_t = 0.9)]
    pub sim_process_success_probability: f64,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// A queue name and its relative share of the workers, parsed from `name=weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWeight {
    /// Queue name.
    pub name: String,
    /// Relative weight; must be positive.
    pub weight: u32,
}

impl FromStr for QueueWeight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, weight) = s
            .split_once('=')
            .ok_or_else(|| format!("expected `name=weight`, got {s:?}"))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(format!("missing queue name in {s:?}"));
        }

        let weight = weight
            .trim()
            .parse()
            .map_err(|e| format!("invalid weight in {s:?}: {e}"))?;

        Ok(Self {
            name: name.to_string(),
            weight,
        })
    }
}

/// Where payments get settled.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayConfig {
    /// A gateway reachable over HTTP.
    Http {
        /// Base URL of the gateway API.
        url: String,
        /// Per-request timeout.
        timeout: Duration,
    },
    /// The built-in random simulation.
    Simulated(SimulationPolicy),
}

/// Invalid combinations of settings.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// `--concurrency 0`.
    #[error("WORKER_CONCURRENCY must be greater than 0")]
    ZeroConcurrency,

    /// A pool that cannot serve every busy worker.
    #[error(
        "DATABASE_MAX_CONNECTIONS is {max_connections}, but {workers} workers need at least {required}"
    )]
    PoolTooSmall {
        /// Configured pool size.
        max_connections: u32,
        /// Workers the runner will start.
        workers: usize,
        /// Smallest pool that serves them all.
        required: u32,
    },

    /// `--poll-interval-ms 0`.
    #[error("WORKER_POLL_INTERVAL_MS must be greater than 0")]
    ZeroPollInterval,

    /// No `--queue` given.
    #[error("at least one queue must be configured")]
    NoQueues,

    /// A queue with weight zero.
    #[error("weight of queue `{0}` must be greater than 0")]
    ZeroWeight(String),

    /// The same queue listed twice.
    #[error("queue `{0}` is configured more than once")]
    DuplicateQueue(String),

    /// `--retry-max-attempts` below zero.
    #[error("RETRY_MAX_ATTEMPTS must not be negative, got {0}")]
    NegativeRetries(i32),

    /// `--payment-check-interval-secs 0`.
    #[error("PAYMENT_CHECK_INTERVAL_SECS must be greater than 0")]
    ZeroCheckInterval,

    /// An empty `--gateway-url`.
    #[error("PAYMENT_GATEWAY_URL must not be empty")]
    EmptyGatewayUrl,

    /// Out-of-range simulation probabilities.
    #[error("invalid simulation settings: {0}")]
    Simulation(String),
}

/// Validated settings of the `payment-worker` binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Size of the connection pool.
    pub max_connections: u32,
    /// Total number of concurrent jobs.
    pub concurrency: usize,
    /// Queues to consume and their weights.
    pub queues: Vec<QueueWeight>,
    /// Idle time between two polls of a queue.
    pub poll_interval: Duration,
    /// Maximum random delay added to every poll.
    pub poll_jitter: Duration,
    /// Settings of the lifecycle handlers.
    pub worker: WorkerConfig,
    /// Delay before the first retry of a failed task.
    pub retry_base_delay: Duration,
    /// Time running jobs get to finish on shutdown.
    pub shutdown_timeout: Duration,
    /// Gateway to settle payments with.
    pub gateway: GatewayConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

/// The job's own transaction plus one for the payment store or task queue.
const CONNECTIONS_PER_WORKER: usize = 2;

/// Number of workers the runner starts: every consumed queue gets at least
/// one, and the payment jobs' queues are consumed even when not listed.
fn worker_count(concurrency: usize, queues: &[QueueWeight]) -> usize {
    let unlisted = [DEFAULT_QUEUE, CRITICAL_QUEUE]
        .into_iter()
        .filter(|name| !queues.iter().any(|q| q.name == *name))
        .count();
    concurrency.max(queues.len() + unlisted)
}

impl TryFrom<CliArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if args.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        for (i, queue) in args.queues.iter().enumerate() {
            if queue.weight == 0 {
                return Err(ConfigError::ZeroWeight(queue.name.clone()));
            }
            if args.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(ConfigError::DuplicateQueue(queue.name.clone()));
            }
        }

        let workers = worker_count(args.concurrency, &args.queues);
        let required =
            u32::try_from(workers.saturating_mul(CONNECTIONS_PER_WORKER)).unwrap_or(u32::MAX);
        let max_connections = args.max_connections.unwrap_or(required);
        if max_connections < required {
            return Err(ConfigError::PoolTooSmall {
                max_connections,
                workers,
                required,
            });
        }

        if args.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if args.retry_max_attempts < 0 {
            return Err(ConfigError::NegativeRetries(args.retry_max_attempts));
        }
        if args.payment_check_interval_secs == 0 {
            return Err(ConfigError::ZeroCheckInterval);
        }

        let gateway = match args.gateway_url {
            Some(url) if url.trim().is_empty() => return Err(ConfigError::EmptyGatewayUrl),
            Some(url) => GatewayConfig::Http {
                url,
                timeout: Duration::from_secs(args.gateway_timeout_secs),
            },
            None => {
                let policy = SimulationPolicy {
                    age_threshold: Duration::from_secs(args.sim_age_threshold_secs),
                    complete_probability: args.sim_complete_probability,
                    fail_probability: args.sim_fail_probability,
                    process_success_probability: args.sim_process_success_probability,
                };
                policy.validate().map_err(ConfigError::Simulation)?;
                GatewayConfig::Simulated(policy)
            }
        };

        Ok(Self {
            database_url: args.database_url,
            max_connections,
            concurrency: args.concurrency,
            queues: args.queues,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            poll_jitter: Duration::from_millis(args.poll_jitter_ms),
            worker: WorkerConfig {
                payment_check_interval: Duration::from_secs(args.payment_check_interval_secs),
                retry_max_attempts: args.retry_max_attempts,
            },
            retry_base_delay: Duration::from_secs(args.retry_delay_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            gateway,
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> CliArgs {
        let args = ["payment-worker", "--database-url", "postgres://localhost/payments"];
        CliArgs::try_parse_from(args.iter().chain(extra)).unwrap()
    }

    fn queue(name: &str, weight: u32) -> QueueWeight {
        QueueWeight {
            name: name.into(),
            weight,
        }
    }

    #[test]
    fn defaults() {
        let config = Config::try_from(parse(&[])).unwrap();

        assert_eq!(config.concurrency, 10);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.poll_jitter, Duration::from_millis(100));
        assert_eq!(
            config.queues,
            vec![queue("critical", 6), queue("default", 3), queue("low", 1)]
        );
        assert_eq!(config.worker.payment_check_interval, Duration::from_secs(300));
        assert_eq!(config.worker.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(
            config.gateway,
            GatewayConfig::Simulated(SimulationPolicy::default())
        );
    }

    #[test]
    fn queues_from_flags() {
        let args = parse(&["--queue", "critical=2", "--queue", "default=1,low=1"]);
        assert_eq!(
            args.queues,
            vec![queue("critical", 2), queue("default", 1), queue("low", 1)]
        );
    }

    #[test]
    fn malformed_queue_weights_are_rejected_by_the_parser() {
        assert_eq!("critical".parse::<QueueWeight>().unwrap_err(), r#"expected `name=weight`, got "critical""#);
        assert!("=3".parse::<QueueWeight>().is_err());
        assert!("low=-1".parse::<QueueWeight>().is_err());
        assert_eq!(" low = 4 ".parse::<QueueWeight>().unwrap(), queue("low", 4));
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let error = Config::try_from(parse(&["--concurrency", "0"])).unwrap_err();
        assert_eq!(error, ConfigError::ZeroConcurrency);

        let error = Config::try_from(parse(&["--poll-interval-ms", "0"])).unwrap_err();
        assert_eq!(error, ConfigError::ZeroPollInterval);

        let error = Config::try_from(parse(&["--queue", "low=0"])).unwrap_err();
        assert_eq!(error, ConfigError::ZeroWeight("low".into()));

        let error = Config::try_from(parse(&["--queue", "low=1,low=2"])).unwrap_err();
        assert_eq!(error, ConfigError::DuplicateQueue("low".into()));

        let error =
            Config::try_from(parse(&["--retry-max-attempts=-1"])).unwrap_err();
        assert_eq!(error, ConfigError::NegativeRetries(-1));

        let error = Config::try_from(parse(&["--sim-fail-probability", "0.5"])).unwrap_err();
        assert!(matches!(error, ConfigError::Simulation(_)));
    }

    #[test]
    fn pool_leaves_a_connection_per_busy_handler() {
        let error = Config::try_from(parse(&["--max-connections", "10"])).unwrap_err();
        assert_eq!(
            error,
            ConfigError::PoolTooSmall {
                max_connections: 10,
                workers: 10,
                required: 20,
            }
        );

        let config = Config::try_from(parse(&["--max-connections", "25"])).unwrap();
        assert_eq!(config.max_connections, 25);

        let config = Config::try_from(parse(&["--concurrency", "4"])).unwrap();
        assert_eq!(config.max_connections, 8);

        // Each queue gets a worker, including the unlisted `critical` one
        let config = Config::try_from(parse(&["--concurrency", "1", "--queue", "low=1"])).unwrap();
        assert_eq!(config.max_connections, 6);

        let error = Config::try_from(parse(&[
            "--concurrency",
            "1",
            "--queue",
            "low=1",
            "--max-connections",
            "5",
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            ConfigError::PoolTooSmall {
                max_connections: 5,
                workers: 3,
                required: 6,
            }
        );
    }

    #[test]
    fn gateway_url_selects_the_http_gateway() {
        let config = Config::try_from(parse(&[
            "--gateway-url",
            "https://gateway.example.com",
            "--gateway-timeout-secs",
            "3",
        ]))
        .unwrap();

        assert_eq!(
            config.gateway,
            GatewayConfig::Http {
                url: "https://gateway.example.com".into(),
                timeout: Duration::from_secs(3),
            }
        );
    }
}
