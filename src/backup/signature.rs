//! Canonical content signature of an event list.
//!
//! Events are normalized (text fields trimmed) and sorted by start, end, summary, location
//! and id before hashing, so two upstream responses that differ only in event order or
//! surrounding whitespace produce the same signature. The description is the final tie-break,
//! since it is part of the hashed payload too.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::CalendarEvent;

/// Trimmed copy of the events in canonical order
pub fn normalize_events(events: &[CalendarEvent]) -> Vec<CalendarEvent> {
    let mut normalized: Vec<CalendarEvent> = events
        .iter()
        .map(|event| CalendarEvent {
            id: event.id.trim().to_string(),
            summary: event.summary.trim().to_string(),
            location: event.location.trim().to_string(),
            description: event
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            start: event.start,
            end: event.end,
        })
        .collect();

    normalized.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.end.cmp(&b.end))
            .then_with(|| a.summary.cmp(&b.summary))
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| a.description.cmp(&b.description))
    });
    normalized
}

/// Hex SHA-256 over the canonical JSON of already-normalized events
pub fn signature_of_normalized(normalized: &[CalendarEvent]) -> Result<String> {
    let canonical = serde_json::to_vec(normalized)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// Normalize, then sign
pub fn compute_signature(events: &[CalendarEvent]) -> Result<String> {
    signature_of_normalized(&normalize_events(events))
}
