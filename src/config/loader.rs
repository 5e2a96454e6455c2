//! Configuration Loader
//!
//! Layered configuration loading: built-in defaults, then an optional TOML file, then
//! `PLANNING_REFRESH__SECTION__KEY` environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::RefreshConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "PLANNING_REFRESH";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "PLANNING_REFRESH_CONFIG";

/// Environment variable naming the deployment environment
pub const ENVIRONMENT_ENV: &str = "PLANNING_REFRESH_ENV";

const DEFAULT_CONFIG_PATH: &str = "config/planning-refresh.toml";

/// Loaded and validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: RefreshConfig,
    environment: String,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    ///
    /// Uses `PLANNING_REFRESH_CONFIG` when set (the file must then exist), otherwise the
    /// default path when present, otherwise defaults plus environment overrides only.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(Path::new(&path), true),
            Err(_) => Self::load_from_file(Path::new(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path, required: bool) -> ConfigResult<Arc<ConfigManager>> {
        if required && !path.is_file() {
            return Err(ConfigurationError::config_file_not_found(path));
        }

        let environment = Self::detect_environment();
        debug!(
            environment = %environment,
            path = %path.display(),
            required = required,
            "Loading configuration"
        );

        let config: RefreshConfig = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        info!(
            environment = %environment,
            max_attempts = config.queue.max_attempts,
            lanes = config.worker.lanes,
            batch_size = config.worker.batch_size,
            per_host_concurrency = config.worker.per_host_concurrency,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            source_path: path.is_file().then(|| path.to_path_buf()),
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: RefreshConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            source_path: None,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was read from, if any
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Detect the deployment environment
    pub fn detect_environment() -> String {
        env::var(ENVIRONMENT_ENV)
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[worker]
lanes = 8
batch_size = 50

[queue]
max_attempts = 4

[backfill.quiet_hours]
start = "22:30"
end = "06:00"
timezone = "Europe/Paris"
"#
        )
        .unwrap();

        let manager = ConfigManager::load_from_file(file.path(), true).unwrap();
        let config = manager.config();
        assert_eq!(config.worker.lanes, 8);
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.queue.max_attempts, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.queue.lease_ttl_seconds, 300);
        assert_eq!(
            config.backfill.quiet_hours.as_ref().map(|q| q.start.as_str()),
            Some("22:30")
        );
        assert_eq!(manager.source_path(), Some(file.path()));
    }

    #[test]
    fn test_missing_required_file_is_an_error() {
        let result = ConfigManager::load_from_file(Path::new("/nonexistent/refresh.toml"), true);
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[worker]\nlanes = 0").unwrap();

        let result = ConfigManager::load_from_file(file.path(), true);
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }
}
