//! Date-range placeholders in feed URLs.
//!
//! Some upstreams only serve a window of events and expect the caller to spell it out in
//! the URL. Registered URLs carry `{start}` / `{end}` tokens (raw or percent-encoded) that
//! are replaced with `YYYY-MM-DD` dates before the request is issued.

use chrono::NaiveDate;

use crate::models::DateRange;

const START_TOKENS: &[&str] = &["{start}", "%7Bstart%7D", "%7bstart%7d"];
const END_TOKENS: &[&str] = &["{end}", "%7Bend%7D", "%7bend%7d"];

/// Whether the URL contains any date-range placeholder
pub fn has_placeholders(url: &str) -> bool {
    START_TOKENS
        .iter()
        .chain(END_TOKENS)
        .any(|token| url.contains(token))
}

/// Replace placeholders with the explicit range, or the default window around `today`
///
/// URLs without placeholders are returned unchanged.
pub fn render_url(url: &str, range: Option<DateRange>, today: NaiveDate) -> String {
    if !has_placeholders(url) {
        return url.to_string();
    }
    let range = range.unwrap_or_else(|| DateRange::default_window(today));
    let start = range.start.format("%Y-%m-%d").to_string();
    let end = range.end.format("%Y-%m-%d").to_string();

    let mut rendered = url.to_string();
    for token in START_TOKENS {
        rendered = rendered.replace(token, &start);
    }
    for token in END_TOKENS {
        rendered = rendered.replace(token, &end);
    }
    rendered
}
