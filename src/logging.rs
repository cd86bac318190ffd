//! # Structured Logging Module
//!
//! Environment-aware structured logging for migration pipelines and drivers.
//!
//! Console output is always enabled; a JSON layer is added when
//! `logging.json` is set in configuration or the environment is `production`.
//! Passwords never reach these helpers: drivers log redacted DSNs only.

use crate::config::LoggingConfig;
use crate::constants::ENVIRONMENT_VARIABLES;
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific defaults
pub fn init_structured_logging() {
    init_structured_logging_with(&LoggingConfig::default());
}

/// Initialize structured logging; only the first call in a process has effect
pub fn init_structured_logging_with(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let json = config.json || environment == "production";

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(config.ansi)
            .with_filter(EnvFilter::new(log_level.clone()));

        let json_layer = json.then(|| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(EnvFilter::new(log_level.clone()))
        });

        // Another subscriber (e.g. a host application's) may already be installed
        if tracing_subscriber::registry()
            .with(console)
            .with(json_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            level = %log_level,
            json = json,
            "Structured logging initialized"
        );
    });
}

/// Current environment from environment variables
pub fn get_environment() -> String {
    ENVIRONMENT_VARIABLES
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .unwrap_or_else(|| "development".to_string())
}

/// Default log level for an environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for migration task operations
pub fn log_migration_operation(
    operation: &str,
    task_id: Option<i64>,
    database: Option<&str>,
    version: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        database = database,
        version = version,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "MIGRATION_OPERATION"
    );
}

/// Log structured data for driver operations
pub fn log_driver_operation(
    engine: &str,
    operation: &str,
    target: &str,
    status: &str,
    duration_ms: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        engine = %engine,
        operation = %operation,
        target = %target,
        status = %status,
        duration_ms = duration_ms,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "DRIVER_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
