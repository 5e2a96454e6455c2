use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::planning::PlanningId;
use crate::fetch::FailureKind;

/// Per-planning refresh history and soft circuit breaker
///
/// Maps to the `planning_refresh_state` table. While `disabled_until` is in the future the
/// planning is skipped by backfill discovery and by queue claims. An explicit user refresh
/// clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RefreshState {
    pub planning_id: PlanningId,
    pub disabled_until: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub last_failure_kind: Option<String>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl RefreshState {
    pub fn new(planning_id: impl Into<String>) -> Self {
        Self {
            planning_id: planning_id.into(),
            disabled_until: None,
            consecutive_failures: 0,
            last_failure_kind: None,
            last_error: None,
            last_attempt_at: None,
            last_success_at: None,
        }
    }

    pub fn is_disabled_at(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until.is_some_and(|until| until > now)
    }

    /// Fold a failed attempt into the state
    pub fn apply_failure(&mut self, failure: &FailureRecord) {
        self.consecutive_failures += 1;
        self.last_failure_kind = Some(failure.kind.as_str().to_string());
        self.last_error = Some(failure.message.clone());
        self.last_attempt_at = Some(failure.at);
        if failure.disabled_until.is_some() {
            self.disabled_until = failure.disabled_until;
        }
    }

    /// Fold a successful attempt into the state
    pub fn apply_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.disabled_until = None;
        self.last_attempt_at = Some(at);
        self.last_success_at = Some(at);
    }
}

/// A failed attempt to be folded into [`RefreshState`]
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    /// Set when the failure opens a disable window
    pub disabled_until: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}
