//! # Fetch Failure Classification
//!
//! Maps a raw upstream outcome (transport error, HTTP response, body) to a closed
//! [`FailureKind`]. Classification is pure: it never performs I/O and takes the current
//! time as a parameter so `Retry-After` dates can be turned into relative delays.
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ RawFetchOutcome  │────▶│  classify()  │────▶│ FetchFailure │
//! │ transport / HTTP │     │              │     │ kind+status  │
//! └──────────────────┘     └──────────────┘     └──────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::client::{RawResponse, TransportError, TransportErrorKind};
use crate::constants::system::VCALENDAR_BEGIN;

/// Closed set of upstream failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "connection_refused")]
    ConnectionRefused,
    #[serde(rename = "network_error")]
    NetworkError,
    #[serde(rename = "http_429")]
    Http429,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "http_5xx")]
    Http5xx,
    #[serde(rename = "invalid_body")]
    InvalidBody,
    #[serde(rename = "parse_error")]
    ParseError,
}

/// How the queue treats a failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// May succeed on retry
    Transient,
    /// Will not succeed on retry; the row is settled immediately
    Permanent,
    /// Upstream answered with unusable content; retried with a long backoff
    ContentInvalid,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::Timeout,
        FailureKind::ConnectionRefused,
        FailureKind::NetworkError,
        FailureKind::Http429,
        FailureKind::Http4xx,
        FailureKind::Http5xx,
        FailureKind::InvalidBody,
        FailureKind::ParseError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::NetworkError => "network_error",
            FailureKind::Http429 => "http_429",
            FailureKind::Http4xx => "http_4xx",
            FailureKind::Http5xx => "http_5xx",
            FailureKind::InvalidBody => "invalid_body",
            FailureKind::ParseError => "parse_error",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            FailureKind::Http4xx => FailureClass::Permanent,
            FailureKind::InvalidBody | FailureKind::ParseError => FailureClass::ContentInvalid,
            FailureKind::Timeout
            | FailureKind::ConnectionRefused
            | FailureKind::NetworkError
            | FailureKind::Http429
            | FailureKind::Http5xx => FailureClass::Transient,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind: {s}"))
    }
}

/// Ephemeral description of a failed fetch
///
/// Only `kind` and `message` outlive the attempt, through `last_error`/`last_failure_kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FailureKind,
    /// HTTP status when the upstream answered
    pub status: Option<u16>,
    /// Server-requested wait for `http_429`
    pub retry_after_ms: Option<u64>,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            retry_after_ms: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseError, message)
    }

    /// Any 4xx other than 429
    pub fn is_permanent(&self) -> bool {
        self.kind.class() == FailureClass::Permanent
    }

    /// `kind: message` form stored in `last_error`
    pub fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("{}: [{}] {}", self.kind, status, self.message),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Raw outcome of one upstream request, before classification
#[derive(Debug, Clone, Copy)]
pub enum RawFetchOutcome<'a> {
    Transport(&'a TransportError),
    Response(&'a RawResponse),
}

/// Classify a raw outcome
///
/// Returns `None` when the response is a 2xx whose body looks like a calendar and may be
/// handed to the parser. A parser failure on such a body is reported separately as
/// [`FailureKind::ParseError`].
pub fn classify(outcome: RawFetchOutcome<'_>, now: DateTime<Utc>) -> Option<FetchFailure> {
    match outcome {
        RawFetchOutcome::Transport(error) => Some(classify_transport(error)),
        RawFetchOutcome::Response(response) => {
            classify_status(response, now).or_else(|| validate_body(response).err())
        }
    }
}

fn classify_transport(error: &TransportError) -> FetchFailure {
    let kind = match error.kind {
        TransportErrorKind::Timeout => FailureKind::Timeout,
        TransportErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
        TransportErrorKind::Other => FailureKind::NetworkError,
    };
    FetchFailure::new(kind, error.message.clone())
}

fn classify_status(response: &RawResponse, now: DateTime<Utc>) -> Option<FetchFailure> {
    let status = response.status;
    let failure = match status {
        200..=299 => return None,
        429 => {
            let mut failure = FetchFailure::new(FailureKind::Http429, "rate limited by upstream");
            failure.retry_after_ms = response
                .retry_after
                .as_deref()
                .and_then(|value| parse_retry_after(value, now));
            failure
        }
        400..=499 => FetchFailure::new(FailureKind::Http4xx, format!("upstream answered {status}")),
        500..=599 => FetchFailure::new(FailureKind::Http5xx, format!("upstream answered {status}")),
        _ => FetchFailure::new(
            FailureKind::NetworkError,
            format!("unexpected upstream status {status}"),
        ),
    };
    Some(failure.with_status(status))
}

/// Structural checks on a 2xx body
fn validate_body(response: &RawResponse) -> Result<(), FetchFailure> {
    let invalid = |message: &str| {
        Err(FetchFailure::new(FailureKind::InvalidBody, message).with_status(response.status))
    };

    if response.truncated {
        return invalid("body exceeds the configured size limit");
    }
    let body = response.body.trim_start_matches('\u{feff}').trim();
    if body.is_empty() {
        return invalid("empty body");
    }

    let head: String = body.chars().take(1024).collect::<String>().to_ascii_lowercase();
    let html_content_type = response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"));
    if html_content_type || head.contains("<!doctype html") || head.contains("<html") {
        return invalid("upstream returned an HTML page");
    }
    if !body.contains(VCALENDAR_BEGIN) {
        return invalid("missing BEGIN:VCALENDAR marker");
    }
    Ok(())
}

/// Parse a `Retry-After` header into a relative delay in milliseconds
///
/// Accepts delta-seconds or an HTTP-date; dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delay = date.with_timezone(&Utc) - now;
    Some(delay.num_milliseconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            retry_after: None,
            content_type: Some("text/calendar".to_string()),
            body: body.to_string(),
            truncated: false,
        }
    }

    const CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_transport_errors_map_by_kind() {
        let now = Utc::now();
        for (kind, expected) in [
            (TransportErrorKind::Timeout, FailureKind::Timeout),
            (TransportErrorKind::ConnectionRefused, FailureKind::ConnectionRefused),
            (TransportErrorKind::Other, FailureKind::NetworkError),
        ] {
            let error = TransportError {
                kind,
                message: "boom".to_string(),
            };
            let failure = classify(RawFetchOutcome::Transport(&error), now).unwrap();
            assert_eq!(failure.kind, expected);
            assert_eq!(failure.status, None);
        }
    }

    #[test]
    fn test_status_bands() {
        let now = Utc::now();
        let cases = [
            (404, FailureKind::Http4xx),
            (403, FailureKind::Http4xx),
            (429, FailureKind::Http429),
            (500, FailureKind::Http5xx),
            (503, FailureKind::Http5xx),
        ];
        for (status, expected) in cases {
            let failure = classify(RawFetchOutcome::Response(&response(status, "")), now).unwrap();
            assert_eq!(failure.kind, expected, "status {status}");
            assert_eq!(failure.status, Some(status));
        }
        assert!(classify(RawFetchOutcome::Response(&response(200, CALENDAR)), now).is_none());
    }

    #[test]
    fn test_429_retry_after_seconds_and_date() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();

        let mut rate_limited = response(429, "");
        rate_limited.retry_after = Some("60".to_string());
        let failure = classify(RawFetchOutcome::Response(&rate_limited), now).unwrap();
        assert_eq!(failure.retry_after_ms, Some(60_000));

        rate_limited.retry_after = Some("Sun, 18 Oct 2026 08:02:00 GMT".to_string());
        let failure = classify(RawFetchOutcome::Response(&rate_limited), now).unwrap();
        assert_eq!(failure.retry_after_ms, Some(120_000));

        rate_limited.retry_after = Some("garbage".to_string());
        let failure = classify(RawFetchOutcome::Response(&rate_limited), now).unwrap();
        assert_eq!(failure.retry_after_ms, None);
    }

    #[test]
    fn test_retry_after_in_the_past_is_zero() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after("Sun, 18 Oct 2026 07:00:00 GMT", now),
            Some(0)
        );
    }

    #[test]
    fn test_invalid_bodies_on_200() {
        let now = Utc::now();
        let bodies = [
            "",
            "   \r\n ",
            "<!DOCTYPE html><html><body>Maintenance</body></html>",
            "<html><head><title>Error</title></head></html>",
            "{\"error\": \"not found\"}",
        ];
        for body in bodies {
            let failure = classify(RawFetchOutcome::Response(&response(200, body)), now).unwrap();
            assert_eq!(failure.kind, FailureKind::InvalidBody, "body {body:?}");
        }

        let mut html = response(200, CALENDAR);
        html.content_type = Some("text/html; charset=utf-8".to_string());
        let failure = classify(RawFetchOutcome::Response(&html), now).unwrap();
        assert_eq!(failure.kind, FailureKind::InvalidBody);

        let mut oversized = response(200, CALENDAR);
        oversized.truncated = true;
        let failure = classify(RawFetchOutcome::Response(&oversized), now).unwrap();
        assert_eq!(failure.kind, FailureKind::InvalidBody);
    }

    #[test]
    fn test_kind_round_trips_through_strings() {
        for kind in FailureKind::ALL {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert!("http_418".parse::<FailureKind>().is_err());
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(FailureKind::Http4xx.class(), FailureClass::Permanent);
        assert_eq!(FailureKind::Http429.class(), FailureClass::Transient);
        assert_eq!(FailureKind::ParseError.class(), FailureClass::ContentInvalid);
        assert!(FetchFailure::new(FailureKind::Http4xx, "x").is_permanent());
        assert!(!FetchFailure::new(FailureKind::Http429, "x").is_permanent());
    }
}
