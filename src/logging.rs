//! # Structured Logging Module
//!
//! Environment-aware structured logging: a console layer for operators and, when a log
//! directory is configured, a JSON file layer for later analysis of refresh cycles.

use crate::config::{ConfigManager, LoggingConfig};
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; only the first call installs the subscriber.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = config
            .filter
            .clone()
            .unwrap_or_else(|| default_log_level(&environment).to_string());
        let env_filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.clone()))
        };

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(environment != "production")
            .with_filter(env_filter());

        let (file_layer, guard, log_dir) = match &config.directory {
            Some(directory) => {
                let log_dir = PathBuf::from(directory);
                if let Err(e) = fs::create_dir_all(&log_dir) {
                    eprintln!("Failed to create log directory {}: {e}", log_dir.display());
                    (None, None, None)
                } else {
                    let file_name = format!("{}.{}.log", environment, process::id());
                    let appender = tracing_appender::rolling::daily(&log_dir, file_name);
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let layer = fmt::layer()
                        .with_writer(writer)
                        .with_target(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(env_filter());
                    (Some(layer), Some(guard), Some(log_dir))
                }
            }
            None => (None, None, None),
        };

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        // A global subscriber may already be installed by an embedding application
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_dir = ?log_dir,
            "Structured logging initialized"
        );

        guard
    });
}

/// Default filter for an environment when `RUST_LOG` is not set
fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_levels() {
        assert_eq!(default_log_level("production"), "info");
        assert_eq!(default_log_level("test"), "warn");
        assert_eq!(default_log_level("development"), "debug");
        assert_eq!(default_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
    }
}
