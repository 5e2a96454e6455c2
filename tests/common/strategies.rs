use chrono::{Duration, TimeZone, Utc};
use planning_refresh::fetch::FailureKind;
use planning_refresh::models::CalendarEvent;
use proptest::prelude::*;

/// Strategy for generating event summaries, with optional surrounding whitespace
pub fn summary_strategy() -> impl Strategy<Value = String> {
    "[ ]{0,2}[A-Za-z][A-Za-z0-9 ]{0,30}[ ]{0,2}"
}

/// Strategy for generating calendar events in late 2026
pub fn event_strategy() -> impl Strategy<Value = CalendarEvent> {
    (
        "[a-z0-9]{4,12}",
        summary_strategy(),
        prop::option::of("[A-Za-z ]{0,20}"),
        prop::option::of("[A-Za-z ]{1,20}"),
        0i64..(90 * 24),
        1i64..8,
    )
        .prop_map(|(uid, summary, location, description, start_hour, hours)| {
            build_event(uid, summary, location, description, start_hour, hours)
        })
}

/// Events drawn from a few keys, so many tie on (start, end, summary, location, id) and
/// differ only in description
pub fn colliding_event_strategy() -> impl Strategy<Value = CalendarEvent> {
    (
        prop::sample::select(vec!["td-1", "td-2"]),
        prop::sample::select(vec!["Analyse", " Analyse", "Chimie"]),
        prop::sample::select(vec!["", "B204"]),
        prop::option::of(prop::sample::select(vec!["Groupe A", "Groupe B", " Groupe A "])),
        0i64..2,
        1i64..3,
    )
        .prop_map(|(uid, summary, location, description, start_hour, hours)| {
            build_event(
                uid.to_string(),
                summary.to_string(),
                Some(location.to_string()),
                description.map(str::to_string),
                start_hour,
                hours,
            )
        })
}

fn build_event(
    uid: String,
    summary: String,
    location: Option<String>,
    description: Option<String>,
    start_hour: i64,
    hours: i64,
) -> CalendarEvent {
    let start = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::hours(start_hour);
    CalendarEvent {
        id: uid,
        summary,
        location: location.unwrap_or_default(),
        description,
        start,
        end: start + Duration::hours(hours),
    }
}

/// A list of events together with a shuffled copy of it
pub fn shuffled_events_strategy(
) -> impl Strategy<Value = (Vec<CalendarEvent>, Vec<CalendarEvent>)> {
    prop::collection::vec(prop_oneof![event_strategy(), colliding_event_strategy()], 0..20)
        .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle()))
}

pub fn failure_kind_strategy() -> impl Strategy<Value = FailureKind> {
    prop::sample::select(FailureKind::ALL.to_vec())
}
