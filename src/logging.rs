//! # Structured Logging Module
//!
//! Environment-aware structured logging for the dispatch and failover paths.
//! Console output is human-readable by default and JSON lines when
//! `PAPA_EVENTS_LOG_FORMAT=json`.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once and alongside a subscriber installed by the
/// host application; the first subscriber wins.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(get_log_level(&environment)));

        let layer = if json_output() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json_output(),
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("PAPA_EVENTS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn json_output() -> bool {
    std::env::var("PAPA_EVENTS_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log the outcome of one delivery
pub fn log_dispatch_outcome(
    use_case: &str,
    event_name: &str,
    message_id: &str,
    retry_count: u32,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::info!(
        use_case = %use_case,
        event_name = %event_name,
        message_id = %message_id,
        retry_count = retry_count,
        outcome = %outcome,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 DISPATCH_OUTCOME"
    );
}

/// Log a failover store operation
pub fn log_failover_operation(
    operation: &str,
    record_id: Option<i64>,
    event_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        record_id = record_id,
        event_name = event_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "💾 FAILOVER_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_per_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
    }
}
