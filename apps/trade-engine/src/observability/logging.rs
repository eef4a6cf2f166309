//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Build the log filter: `RUST_LOG` when set, otherwise the configured
/// level for the engine's own targets.
#[must_use]
pub fn log_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,trade_engine={}", config.level)))
}

/// Install the global tracing subscriber.
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = log_filter(config);
    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Tracing subscriber already installed: {e}");
    }
}
