use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Read-only operational view of the refresh pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpsSnapshot {
    /// Rows in the queue
    pub queue_depth: i64,
    /// Rows claimable right now
    pub ready: i64,
    /// Rows under a fresh lease
    pub locked: i64,
    /// Rows carrying a permanent or give-up marker
    pub terminal: i64,
    /// Plannings inside an active disable window
    pub disabled: i64,
    pub staleness: StalenessBuckets,
    /// Highest-priority pending rows
    pub top_pending: Vec<PendingEntrySummary>,
    pub taken_at: DateTime<Utc>,
}

/// Registered plannings grouped by age of their last confirmed backup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StalenessBuckets {
    pub under_1h: i64,
    pub from_1h_to_6h: i64,
    pub from_6h_to_24h: i64,
    pub over_24h: i64,
    pub never: i64,
}

impl StalenessBuckets {
    /// Place one backup age into its bucket
    pub fn record(&mut self, refreshed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let Some(refreshed_at) = refreshed_at else {
            self.never += 1;
            return;
        };
        let age_hours = (now - refreshed_at).num_minutes() as f64 / 60.0;
        if age_hours < 1.0 {
            self.under_1h += 1;
        } else if age_hours < 6.0 {
            self.from_1h_to_6h += 1;
        } else if age_hours < 24.0 {
            self.from_6h_to_24h += 1;
        } else {
            self.over_24h += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingEntrySummary {
    pub planning_id: String,
    pub priority: i32,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
