use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Hierarchical planning identifier, e.g. `univ.sciences.l3-info.g2`
pub type PlanningId = String;

/// A planning and the upstream feed backing it
///
/// Maps to the `plannings` table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct PlanningRef {
    pub id: PlanningId,
    pub url: String,
}

impl PlanningRef {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// A single calendar event as stored in backups and returned to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Upstream UID
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarEvent {
    /// Whether the event intersects the inclusive day range
    pub fn overlaps(&self, range: &DateRange) -> bool {
        let range_start = range.start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        let range_end = range
            .end
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());

        match (range_start, range_end) {
            (Some(start), Some(end)) => self.start < end && self.end >= start,
            _ => true,
        }
    }
}

/// Inclusive day range used for upstream placeholders and backup filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// One month in the past to two years ahead of `today`
    pub fn default_window(today: NaiveDate) -> Self {
        let start = today.checked_sub_months(Months::new(1)).unwrap_or(today);
        let end = today.checked_add_months(Months::new(24)).unwrap_or(today);
        Self { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(start: (u32, u32), end: (u32, u32)) -> CalendarEvent {
        CalendarEvent {
            id: "uid-1".to_string(),
            summary: "Algorithmique".to_string(),
            location: "Amphi A".to_string(),
            description: None,
            start: Utc.with_ymd_and_hms(2026, start.0, start.1, 8, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, end.0, end.1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_default_window_spans_past_month_and_two_years() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let window = DateRange::default_window(today);
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2028, 3, 31).unwrap());
    }

    #[test]
    fn test_overlaps_is_inclusive_of_range_end_day() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 5, 10).unwrap(),
        );
        assert!(event((5, 10), (5, 10)).overlaps(&range));
        assert!(event((4, 30), (5, 1)).overlaps(&range));
        assert!(!event((5, 11), (5, 11)).overlaps(&range));
        assert!(!event((4, 20), (4, 21)).overlaps(&range));
    }
}
