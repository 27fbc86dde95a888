pub mod aggregator;
pub mod config;
pub mod error;
pub mod http;
pub mod trading;

pub use config::{AggregatorConfig, Credentials};
pub use error::AggregatorError;

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging honoring `RUST_LOG`; safe to call more than once.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init()
        .ok();
}

/// Daily-rolling file logging under `dir`. Keep the returned guard alive for
/// the lifetime of the process or buffered lines are lost.
pub fn init_file_logging(
    dir: &str,
    file_prefix: &str,
) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok();
    guard
}
