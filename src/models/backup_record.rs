use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::planning::{CalendarEvent, PlanningId};

/// Stored event snapshot of a planning
///
/// Maps to the `planning_backups` table. `updated_at` moves only when the content signature
/// changes; `refreshed_at` moves on every confirmed fetch, changed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub planning_id: PlanningId,
    pub events: Vec<CalendarEvent>,
    pub signature: String,
    pub updated_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}
