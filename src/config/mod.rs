//! # Planning Refresh Configuration
//!
//! Every tuning knob of the refresh pipeline lives here: batch sizes, lane counts, poll
//! intervals, attempt limits, per-host concurrency, quiet hours, throttle windows and map caps.
//! The core only consumes these values; loading and layering is handled by [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use planning_refresh::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let worker = &manager.config().worker;
//! println!("{} lanes, batch of {}", worker.lanes, worker.batch_size);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Database connection settings
    pub database: DatabaseConfig,

    /// Durable work queue limits
    pub queue: QueueConfig,

    /// Refresh worker drain and poll loop
    pub worker: WorkerConfig,

    /// Periodic staleness scanner
    pub backfill: BackfillConfig,

    /// Upstream HTTP fetches
    pub fetch: FetchConfig,

    /// Backup snapshot writer
    pub backup: BackupConfig,

    /// User-triggered refresh throttling
    pub refresh_requests: RefreshRequestConfig,

    /// In-flight request coalescing
    pub coalescer: CoalescerConfig,

    /// Retry backoff
    pub backoff: BackoffConfig,

    /// Log output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply the embedded schema on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/planning_refresh".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 5,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts after which a row is given up and deleted
    pub max_attempts: i32,
    /// Age after which a lease is treated as abandoned
    pub lease_ttl_seconds: u64,
    /// Maximum rows migrated by one sweep call
    pub sweep_batch_size: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            lease_ttl_seconds: 300, // 5 minutes
            sweep_batch_size: 100,
        }
    }
}

impl QueueConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifier written into `lock_owner`; a random one is generated when absent
    pub worker_id: Option<String>,
    /// Rows claimed per claim query
    pub batch_size: i64,
    /// Concurrent lanes pulling from one claimed batch
    pub lanes: usize,
    /// Wall-clock budget of a single drain call
    pub drain_budget_ms: u64,
    pub min_idle_ms: u64,
    pub max_idle_ms: u64,
    /// Pause between two items of the same lane
    pub item_pacing_ms: u64,
    /// Concurrent fetches allowed per upstream host
    pub per_host_concurrency: usize,
    pub stats_log_interval_seconds: u64,
    /// Number of pending rows included in the periodic queue snapshot
    pub snapshot_top_n: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            batch_size: 20,
            lanes: 4,
            drain_budget_ms: 20_000,
            min_idle_ms: 1_000,
            max_idle_ms: 30_000,
            item_pacing_ms: 0,
            per_host_concurrency: 2,
            stats_log_interval_seconds: 300,
            snapshot_top_n: 5,
        }
    }
}

impl WorkerConfig {
    pub fn drain_budget(&self) -> Duration {
        Duration::from_millis(self.drain_budget_ms)
    }

    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.min_idle_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn item_pacing(&self) -> Duration {
        Duration::from_millis(self.item_pacing_ms)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Backups older than this are re-enqueued
    pub staleness_seconds: u64,
    /// Maximum plannings enqueued by one scan
    pub scan_limit: i64,
    pub quiet_hours: Option<QuietHoursConfig>,
    /// Sleep slice used while inside quiet hours
    pub quiet_sleep_seconds: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 600,    // 10 minutes
            staleness_seconds: 21600, // 6 hours
            scan_limit: 500,
            quiet_hours: None,
            quiet_sleep_seconds: 300,
        }
    }
}

impl BackfillConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_seconds)
    }

    pub fn quiet_sleep(&self) -> Duration {
        Duration::from_secs(self.quiet_sleep_seconds)
    }
}

/// Local time-of-day window during which the backfill scanner sleeps
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuietHoursConfig {
    /// `HH:MM` local start (inclusive)
    pub start: String,
    /// `HH:MM` local end (exclusive); may be earlier than `start` to cross midnight
    pub end: String,
    /// IANA timezone name, e.g. `Europe/Paris`
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Bodies larger than this are rejected as invalid
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            user_agent: format!("planning-refresh/{}", crate::constants::system::VERSION),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Minimum spacing between two throttled writes of the same planning
    pub min_write_spacing_seconds: u64,
    /// Hard cap on tracked keys in the throttled writer
    pub max_tracked_keys: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            min_write_spacing_seconds: 30,
            max_tracked_keys: 500,
        }
    }
}

impl BackupConfig {
    pub fn min_write_spacing(&self) -> Duration {
        Duration::from_secs(self.min_write_spacing_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshRequestConfig {
    /// A planning can be refreshed by a user at most once per window
    pub throttle_window_seconds: u64,
    /// Hard cap on tracked keys in the throttle map
    pub max_tracked_keys: usize,
}

impl Default for RefreshRequestConfig {
    fn default() -> Self {
        Self {
            throttle_window_seconds: 60,
            max_tracked_keys: 1_000,
        }
    }
}

impl RefreshRequestConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Beyond this many distinct in-flight keys, calls run uncoalesced
    pub max_in_flight_keys: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_keys: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Upper bound of the exponential delay
    pub max_delay_ms: u64,
    /// Relative jitter applied to the final delay (0.2 = ±20%)
    pub jitter_ratio: f64,
    pub jitter_enabled: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: 600_000, // 10 minutes
            jitter_ratio: 0.2,
            jitter_enabled: true,
        }
    }
}

impl BackoffConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, a JSON log file is written into this directory
    pub directory: Option<String>,
    /// Overrides the environment-derived default filter
    pub filter: Option<String>,
}

impl RefreshConfig {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.batch_size < 1 {
            return Err(ConfigurationError::invalid_value(
                "worker.batch_size",
                self.worker.batch_size.to_string(),
                "must be at least 1",
            ));
        }
        if self.worker.lanes == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.lanes",
                "0",
                "must be at least 1",
            ));
        }
        if self.worker.per_host_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.per_host_concurrency",
                "0",
                "must be at least 1",
            ));
        }
        if self.worker.min_idle_ms == 0 || self.worker.min_idle_ms > self.worker.max_idle_ms {
            return Err(ConfigurationError::invalid_value(
                "worker.min_idle_ms",
                self.worker.min_idle_ms.to_string(),
                format!(
                    "must be positive and not exceed worker.max_idle_ms ({})",
                    self.worker.max_idle_ms
                ),
            ));
        }
        if self.queue.max_attempts < 1 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_attempts",
                self.queue.max_attempts.to_string(),
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_ratio",
                self.backoff.jitter_ratio.to_string(),
                "must be within [0, 1)",
            ));
        }
        if self.backup.max_tracked_keys == 0 || self.refresh_requests.max_tracked_keys == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_tracked_keys",
                "0",
                "key caps must be at least 1",
            ));
        }
        if let Some(quiet) = &self.backfill.quiet_hours {
            for (field, value) in [("start", &quiet.start), ("end", &quiet.end)] {
                if NaiveTime::parse_from_str(value, "%H:%M").is_err() {
                    return Err(ConfigurationError::invalid_value(
                        format!("backfill.quiet_hours.{field}"),
                        value.clone(),
                        "expected HH:MM",
                    ));
                }
            }
            if quiet.timezone.parse::<chrono_tz::Tz>().is_err() {
                return Err(ConfigurationError::invalid_value(
                    "backfill.quiet_hours.timezone",
                    quiet.timezone.clone(),
                    "unknown IANA timezone",
                ));
            }
        }
        Ok(())
    }
}
