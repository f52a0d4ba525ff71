//! # Structured Logging Module
//!
//! Environment-aware console logging for applications embedding pg-pubsub and
//! for the bundled CLI. The library itself only emits `tracing` events; nothing
//! is installed unless [`init_logging`] is called.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Filter directive variable, checked before `RUST_LOG`
pub const LOG_FILTER_VAR: &str = "PG_PUBSUB_LOG";

/// Output format variable; `json` switches to JSON lines
pub const LOG_FORMAT_VAR: &str = "PG_PUBSUB_LOG_FORMAT";

/// Initialize console logging once per process
///
/// An already installed global subscriber is left in place.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = get_filter(&environment);
        let json = std::env::var(LOG_FORMAT_VAR)
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            filter = %filter,
            json,
            "Logging initialized"
        );
    });
}

/// Current environment name
fn get_environment() -> String {
    std::env::var("PG_PUBSUB_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Filter directives: explicit variables first, then the environment default
fn get_filter(environment: &str) -> String {
    std::env::var(LOG_FILTER_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| get_log_level(environment).to_string())
}

/// Default log level for an environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
