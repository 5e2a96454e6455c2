use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::planning::PlanningId;

/// A row of the durable work queue
///
/// Maps to the `refresh_queue` table. At most one row exists per planning; re-enqueueing
/// merges into it. `locked_at`/`lock_owner` form an advisory lease, not a mutex: once the
/// lease is older than the TTL another worker may claim the row again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkQueueEntry {
    pub planning_id: PlanningId,
    /// Higher = more urgent
    pub priority: i32,
    pub requested_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    /// Incremented by every claim, never decremented
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
    /// Last time the row was written (claim, requeue, merge)
    pub updated_at: DateTime<Utc>,
}

impl WorkQueueEntry {
    /// Fresh row as inserted by an enqueue
    pub fn new(
        planning_id: impl Into<String>,
        priority: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            planning_id: planning_id.into(),
            priority,
            requested_at: now,
            next_attempt_at,
            attempts: 0,
            locked_at: None,
            lock_owner: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Whether the row carries a permanent-failure or give-up marker
    pub fn is_terminal(&self) -> bool {
        crate::constants::error_markers::is_terminal(self.last_error.as_deref())
    }

    /// Whether the lease is held and not yet expired at `now`
    pub fn has_fresh_lease(&self, now: DateTime<Utc>, lease_ttl: chrono::Duration) -> bool {
        self.locked_at.is_some_and(|locked_at| locked_at > now - lease_ttl)
    }
}

/// A row returned by an atomic claim, with its post-increment attempt count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClaimedEntry {
    pub planning_id: PlanningId,
    /// Feed URL, absent when the planning is no longer registered
    pub url: Option<String>,
    pub priority: i32,
    pub attempts: i32,
    pub requested_at: DateTime<Utc>,
}

/// Result of a single-item enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// No row existed; a new one was inserted
    Inserted,
    /// Merged into the existing row
    Merged,
    /// A settled row was reset, either by a higher priority request or once its settlement
    /// is older than the merge grace period
    Revived,
    /// The existing row settled recently and the new priority is not higher
    Skipped,
}
