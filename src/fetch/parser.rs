//! Calendar text to events.
//!
//! The refresh core treats parsing as an opaque function behind [`CalendarParser`].
//! [`IcsParser`] is the default implementation on top of the `icalendar` parser.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use icalendar::{
    parser::{read_calendar, unfold},
    CalendarDateTime, DatePerhapsTime,
};
use sha2::{Digest, Sha256};

use crate::error::{RefreshError, Result};
use crate::models::CalendarEvent;

pub trait CalendarParser: Send + Sync {
    /// Parse a structurally valid calendar body into events
    fn parse(&self, body: &str) -> Result<Vec<CalendarEvent>>;
}

/// iCalendar (RFC 5545) parser
#[derive(Debug, Clone, Copy, Default)]
pub struct IcsParser;

impl CalendarParser for IcsParser {
    fn parse(&self, body: &str) -> Result<Vec<CalendarEvent>> {
        let unfolded = unfold(body);
        let calendar = read_calendar(&unfolded)
            .map_err(|e| RefreshError::ParseError(format!("invalid iCalendar: {e}")))?;

        let mut events = Vec::new();
        for vevent in calendar.components.iter().filter(|c| c.name == "VEVENT") {
            let start_prop = vevent
                .find_prop("DTSTART")
                .ok_or_else(|| RefreshError::ParseError("VEVENT without DTSTART".to_string()))?;
            let start = DatePerhapsTime::try_from(start_prop)
                .map(to_utc)
                .map_err(|_| RefreshError::ParseError("unreadable DTSTART".to_string()))?;
            let end = vevent
                .find_prop("DTEND")
                .and_then(|p| DatePerhapsTime::try_from(p).ok())
                .map(to_utc)
                .unwrap_or(start);

            let summary = vevent
                .find_prop("SUMMARY")
                .map(|p| p.val.to_string())
                .unwrap_or_default();
            let location = vevent
                .find_prop("LOCATION")
                .map(|p| p.val.to_string())
                .unwrap_or_default();
            let description = vevent.find_prop("DESCRIPTION").map(|p| p.val.to_string());
            let id = vevent
                .find_prop("UID")
                .map(|p| p.val.to_string())
                .unwrap_or_else(|| synthetic_uid(&summary, &location, start, end));

            events.push(CalendarEvent {
                id,
                summary,
                location,
                description,
                start,
                end,
            });
        }
        Ok(events)
    }
}

fn to_utc(value: DatePerhapsTime) -> DateTime<Utc> {
    match value {
        DatePerhapsTime::Date(date) => date_to_utc(date),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => dt,
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => naive.and_utc(),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            zoned_to_utc(date_time, &tzid)
        }
    }
}

fn date_to_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

/// Unknown TZIDs fall back to treating the wall time as UTC
fn zoned_to_utc(date_time: NaiveDateTime, tzid: &str) -> DateTime<Utc> {
    match tzid.parse::<chrono_tz::Tz>() {
        Ok(tz) => tz
            .from_local_datetime(&date_time)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| date_time.and_utc()),
        Err(_) => date_time.and_utc(),
    }
}

/// Stable identifier for events published without a UID
fn synthetic_uid(
    summary: &str,
    location: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(summary.as_bytes());
    hasher.update([0]);
    hasher.update(location.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_rfc3339().as_bytes());
    hasher.update(end.to_rfc3339().as_bytes());
    format!("generated-{:x}", hasher.finalize())
}
