//! Enqueue merge decisions.
//!
//! Both store implementations read the existing row (if any), ask these functions what to do,
//! and apply the answer. Keeping the decision pure keeps the Postgres and in-memory stores
//! in lockstep and makes the rules testable without a database.

use chrono::{DateTime, Duration, Utc};

use crate::constants::{priority, system::SETTLED_MERGE_GRACE_SECONDS};
use crate::models::WorkQueueEntry;

/// What an enqueue does to the queue row of a planning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePlan {
    /// No row exists: insert a fresh one
    Insert {
        priority: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Leave the existing row untouched
    Skip,
    /// Raise priority and pull `next_attempt_at` forward; lease and attempts are kept
    Merge {
        priority: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Reset a settled row: attempts to zero, error and lease cleared
    Revive {
        priority: i32,
        next_attempt_at: DateTime<Utc>,
    },
}

fn merged_priority(existing: i32, requested: i32) -> i32 {
    existing.max(requested).min(priority::MAX)
}

/// Single-item enqueue (explicit refresh path)
///
/// A settled row is skipped while its settlement is fresher than the grace period and the
/// request does not raise its priority; otherwise it is revived.
pub fn plan_single(
    existing: Option<&WorkQueueEntry>,
    requested_priority: i32,
    next_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MergePlan {
    let requested_priority = requested_priority.min(priority::MAX);
    let Some(existing) = existing else {
        return MergePlan::Insert {
            priority: requested_priority,
            next_attempt_at,
        };
    };

    let priority = merged_priority(existing.priority, requested_priority);
    let next_attempt_at = existing.next_attempt_at.min(next_attempt_at);

    if !existing.is_terminal() {
        return MergePlan::Merge {
            priority,
            next_attempt_at,
        };
    }

    let settled_recently =
        existing.updated_at > now - Duration::seconds(SETTLED_MERGE_GRACE_SECONDS);
    if settled_recently && requested_priority <= existing.priority {
        MergePlan::Skip
    } else {
        MergePlan::Revive {
            priority,
            next_attempt_at,
        }
    }
}

/// Batch enqueue (backfill path): settled rows stay frozen regardless of age or priority
pub fn plan_batch(
    existing: Option<&WorkQueueEntry>,
    requested_priority: i32,
    next_attempt_at: DateTime<Utc>,
) -> MergePlan {
    let requested_priority = requested_priority.min(priority::MAX);
    match existing {
        None => MergePlan::Insert {
            priority: requested_priority,
            next_attempt_at,
        },
        Some(existing) if existing.is_terminal() => MergePlan::Skip,
        Some(existing) => MergePlan::Merge {
            priority: merged_priority(existing.priority, requested_priority),
            next_attempt_at: existing.next_attempt_at.min(next_attempt_at),
        },
    }
}

/// Apply a plan to a row in place; returns the row to insert for [`MergePlan::Insert`]
pub fn apply_plan(
    plan: MergePlan,
    planning_id: &str,
    existing: Option<&mut WorkQueueEntry>,
    now: DateTime<Utc>,
) -> Option<WorkQueueEntry> {
    match (plan, existing) {
        (
            MergePlan::Insert {
                priority,
                next_attempt_at,
            },
            _,
        ) => Some(WorkQueueEntry::new(planning_id, priority, next_attempt_at, now)),
        (
            MergePlan::Merge {
                priority,
                next_attempt_at,
            },
            Some(entry),
        ) => {
            entry.priority = priority;
            entry.next_attempt_at = next_attempt_at;
            entry.updated_at = now;
            None
        }
        (
            MergePlan::Revive {
                priority,
                next_attempt_at,
            },
            Some(entry),
        ) => {
            entry.priority = priority;
            entry.next_attempt_at = next_attempt_at;
            entry.requested_at = now;
            entry.attempts = 0;
            entry.locked_at = None;
            entry.lock_owner = None;
            entry.last_error = None;
            entry.updated_at = now;
            None
        }
        _ => None,
    }
}
