//! # System Constants
//!
//! Priorities, markers and limits shared by the queue, the worker and the backfill scanner.

/// Queue priorities (higher = more urgent)
pub mod priority {
    /// Priority used by the periodic backfill scanner
    pub const BACKFILL: i32 = 10;

    /// Priority used by explicit user-triggered refreshes
    pub const USER_REFRESH: i32 = 50;

    /// Merged priorities never exceed this value
    pub const MAX: i32 = 100;
}

/// Prefixes written into `last_error` so terminal rows can be recognised in SQL and in memory
pub mod error_markers {
    /// Row settled by a permanent 4xx response
    pub const PERMANENT: &str = "permanent:";

    /// Row settled by exhausting its attempts
    pub const MAX_ATTEMPTS: &str = "max_attempts:";

    /// All markers that freeze a row against backfill merges
    pub const TERMINAL: &[&str] = &[PERMANENT, MAX_ATTEMPTS];

    /// Whether an error string marks a row as settled
    pub fn is_terminal(last_error: Option<&str>) -> bool {
        last_error.is_some_and(|error| TERMINAL.iter().any(|marker| error.starts_with(marker)))
    }
}

/// Process-level identifiers
pub mod system {
    /// Job identifier of the refresh worker loop in the jobs registry
    pub const REFRESH_WORKER_JOB: &str = "refresh-worker";

    /// Job identifier of the backfill scanner loop in the jobs registry
    pub const BACKFILL_JOB: &str = "backfill-scanner";

    /// Single-item merges are skipped for this long after a row settles
    pub const SETTLED_MERGE_GRACE_SECONDS: i64 = 30;

    /// Calendar marker every valid feed body must contain
    pub const VCALENDAR_BEGIN: &str = "BEGIN:VCALENDAR";

    /// Crate version reported in the upstream User-Agent
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
