//! Local time-of-day window during which the backfill scanner sleeps.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::config::{ConfigResult, ConfigurationError, QuietHoursConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    /// Inclusive
    pub start: NaiveTime,
    /// Exclusive
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime, timezone: Tz) -> Self {
        Self {
            start,
            end,
            timezone,
        }
    }

    pub fn from_config(config: &QuietHoursConfig) -> ConfigResult<Self> {
        let parse_time = |field: &str, value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                ConfigurationError::invalid_value(
                    format!("backfill.quiet_hours.{field}"),
                    value,
                    "expected HH:MM",
                )
            })
        };
        let timezone = config.timezone.parse::<Tz>().map_err(|_| {
            ConfigurationError::invalid_value(
                "backfill.quiet_hours.timezone",
                config.timezone.clone(),
                "unknown IANA timezone",
            )
        })?;
        Ok(Self::new(
            parse_time("start", &config.start)?,
            parse_time("end", &config.end)?,
            timezone,
        ))
    }

    /// Whether the local wall-clock time is inside the window
    ///
    /// A window whose end is earlier than its start crosses midnight. Equal bounds describe
    /// an empty window.
    pub fn contains_local(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.contains_local(instant.with_timezone(&self.timezone).time())
    }
}
