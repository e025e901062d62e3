//! Log output of the `payment-worker` binary.
//!
//! Events go to stdout through `tracing_subscriber::fmt`, either human
//! readable or as one JSON object per line. The filter is taken from
//! `RUST_LOG` and defaults to `info`.

use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log lines.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable output with span context.
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Installs the global tracing subscriber.
///
/// Fails if a global subscriber has already been set.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));

    match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_timer(ChronoLocal::rfc_3339())
                    .with_file(true)
                    .pretty(),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_timer(ChronoUtc::rfc_3339()),
            )
            .try_init()?,
    }

    Ok(())
}
