use chrono::{DateTime, TimeZone, Utc};
use planning_refresh::config::RefreshConfig;
use planning_refresh::database::{MemoryRefreshStore, RefreshStore};
use planning_refresh::models::{CalendarEvent, PlanningRef};
use planning_refresh::orchestration::RefreshSystem;
use std::sync::Arc;

use super::fake_client::FakeFeedClient;

/// Configuration tuned for tests: no jitter, short idle waits, backfill off
pub fn test_config() -> RefreshConfig {
    let mut config = RefreshConfig::default();
    config.backoff.jitter_enabled = false;
    config.worker.worker_id = Some("test-worker".to_string());
    config.worker.min_idle_ms = 10;
    config.worker.max_idle_ms = 50;
    config.worker.stats_log_interval_seconds = 3600;
    config.backfill.enabled = false;
    config.backup.min_write_spacing_seconds = 0;
    config
}

pub struct TestHarness {
    pub store: Arc<MemoryRefreshStore>,
    pub client: Arc<FakeFeedClient>,
    pub system: RefreshSystem,
}

pub fn harness_with(config: RefreshConfig) -> TestHarness {
    let store = Arc::new(MemoryRefreshStore::new());
    let client = Arc::new(FakeFeedClient::new());
    let system = RefreshSystem::build(&config, store.clone(), client.clone())
        .expect("test configuration is valid");
    TestHarness {
        store,
        client,
        system,
    }
}

pub fn harness() -> TestHarness {
    harness_with(test_config())
}

pub fn feed_url(planning_id: &str) -> String {
    format!("https://feeds.example.test/{planning_id}.ics")
}

/// Register a planning whose feed lives at [`feed_url`]
pub async fn register(store: &MemoryRefreshStore, planning_id: &str) -> PlanningRef {
    let planning = PlanningRef::new(planning_id, feed_url(planning_id));
    store
        .upsert_planning(&planning)
        .await
        .expect("memory store never fails");
    planning
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0).unwrap()
}

pub fn event(uid: &str, summary: &str, day: u32, hour: u32) -> CalendarEvent {
    CalendarEvent {
        id: uid.to_string(),
        summary: summary.to_string(),
        location: "Amphi B".to_string(),
        description: None,
        start: at(day, hour),
        end: at(day, hour + 2),
    }
}

/// iCalendar body with one two-hour event per `(uid, summary, day, hour)` in October 2026
pub fn ics_feed(events: &[(&str, &str, u32, u32)]) -> String {
    let mut body = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Feeds//Test//EN\r\n");
    for (uid, summary, day, hour) in events {
        body.push_str(&format!(
            "BEGIN:VEVENT\r\nUID:{uid}\r\nDTSTAMP:20261001T000000Z\r\n\
             DTSTART:202610{day:02}T{hour:02}0000Z\r\nDTEND:202610{day:02}T{end:02}0000Z\r\n\
             SUMMARY:{summary}\r\nLOCATION:Amphi B\r\nEND:VEVENT\r\n",
            end = hour + 2
        ));
    }
    body.push_str("END:VCALENDAR\r\n");
    body
}
