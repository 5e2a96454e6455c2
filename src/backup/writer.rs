//! Backup writes: a direct conditional upsert and a throttled fire-and-forget path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::signature::{normalize_events, signature_of_normalized};
use crate::config::BackupConfig;
use crate::database::RefreshStore;
use crate::error::Result;
use crate::models::{CalendarEvent, PlanningId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupWriteOutcome {
    /// Whether the stored content changed
    pub changed: bool,
    pub signature: String,
}

/// Direct writer used by the refresh worker
#[derive(Clone)]
pub struct BackupWriter {
    store: Arc<dyn RefreshStore>,
}

impl BackupWriter {
    pub fn new(store: Arc<dyn RefreshStore>) -> Self {
        Self { store }
    }

    /// Store the events in canonical order if their signature differs from the stored one
    pub async fn write(
        &self,
        planning_id: &str,
        events: &[CalendarEvent],
    ) -> Result<BackupWriteOutcome> {
        let normalized = normalize_events(events);
        let signature = signature_of_normalized(&normalized)?;
        let changed = self
            .store
            .upsert_backup_if_changed(planning_id, &normalized, &signature, chrono::Utc::now())
            .await?;
        debug!(planning_id, changed, events = normalized.len(), "Backup written");
        Ok(BackupWriteOutcome { changed, signature })
    }
}

/// Result of [`ThrottledBackupWriter::schedule_planning_backup_write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A flush was started for this key
    Scheduled,
    /// A flush is already pending; the payload replaced the previous one
    Coalesced,
    /// The key map is full and the key is new; nothing will be written
    Rejected,
}

#[derive(Debug)]
struct KeyState {
    /// Latest payload not yet written
    pending: Option<Vec<CalendarEvent>>,
    /// A flush task owns this key
    scheduled: bool,
    last_write_at: Option<Instant>,
}

impl KeyState {
    fn is_idle(&self, now: Instant, spacing: Duration) -> bool {
        !self.scheduled
            && self.pending.is_none()
            && self
                .last_write_at
                .map_or(true, |at| now.saturating_duration_since(at) >= spacing)
    }
}

/// Asynchronous writer used by the read path so user requests never wait on the database
///
/// Per key: latest payload wins, writes are at least `min_spacing` apart, and at most one
/// flush task is alive. The key map is capped; once full, idle keys are pruned and new keys
/// are rejected if none could be.
pub struct ThrottledBackupWriter {
    writer: BackupWriter,
    min_spacing: Duration,
    max_keys: usize,
    keys: Mutex<HashMap<PlanningId, KeyState>>,
}

impl ThrottledBackupWriter {
    pub fn new(writer: BackupWriter, config: &BackupConfig) -> Self {
        Self {
            writer,
            min_spacing: config.min_write_spacing(),
            max_keys: config.max_tracked_keys.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a write of `events` for `planning_id`; must be called inside a Tokio runtime
    pub fn schedule_planning_backup_write(
        self: &Arc<Self>,
        planning_id: &str,
        events: Vec<CalendarEvent>,
    ) -> ScheduleOutcome {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if let Some(state) = keys.get_mut(planning_id) {
            state.pending = Some(events);
            if state.scheduled {
                return ScheduleOutcome::Coalesced;
            }
            state.scheduled = true;
            let delay = state
                .last_write_at
                .map(|at| self.min_spacing.saturating_sub(now.saturating_duration_since(at)))
                .unwrap_or(Duration::ZERO);
            drop(keys);
            self.spawn_flush(planning_id.to_string(), delay);
            return ScheduleOutcome::Scheduled;
        }

        if keys.len() >= self.max_keys {
            let spacing = self.min_spacing;
            keys.retain(|_, state| !state.is_idle(now, spacing));
        }
        if keys.len() >= self.max_keys {
            warn!(
                planning_id,
                max_keys = self.max_keys,
                "Backup write map full, rejecting new key"
            );
            return ScheduleOutcome::Rejected;
        }

        keys.insert(
            planning_id.to_string(),
            KeyState {
                pending: Some(events),
                scheduled: true,
                last_write_at: None,
            },
        );
        drop(keys);
        self.spawn_flush(planning_id.to_string(), Duration::ZERO);
        ScheduleOutcome::Scheduled
    }

    /// Keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }

    /// Keys with a flush task alive
    pub fn pending_flushes(&self) -> usize {
        self.keys.lock().values().filter(|state| state.scheduled).count()
    }

    fn spawn_flush(self: &Arc<Self>, planning_id: String, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.flush(planning_id, delay).await });
    }

    async fn flush(self: Arc<Self>, planning_id: String, mut delay: Duration) {
        loop {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let events = {
                let mut keys = self.keys.lock();
                let Some(state) = keys.get_mut(&planning_id) else {
                    return;
                };
                match state.pending.take() {
                    Some(events) => events,
                    None => {
                        state.scheduled = false;
                        return;
                    }
                }
            };

            if let Err(error) = self.writer.write(&planning_id, &events).await {
                warn!(planning_id = %planning_id, error = %error, "Throttled backup write failed");
            }

            let mut keys = self.keys.lock();
            let Some(state) = keys.get_mut(&planning_id) else {
                return;
            };
            state.last_write_at = Some(Instant::now());
            if state.pending.is_none() {
                state.scheduled = false;
                return;
            }
            delay = self.min_spacing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryRefreshStore;
    use chrono::{TimeZone, Utc};

    fn events(summary: &str) -> Vec<CalendarEvent> {
        vec![CalendarEvent {
            id: "uid-1".to_string(),
            summary: summary.to_string(),
            location: String::new(),
            description: None,
            start: Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 10, 20, 10, 0, 0).unwrap(),
        }]
    }

    async fn wait_for_flushes(writer: &ThrottledBackupWriter) {
        for _ in 0..200 {
            if writer.pending_flushes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("flushes did not settle");
    }

    #[tokio::test]
    async fn test_direct_write_reports_change_once() {
        let store = Arc::new(MemoryRefreshStore::new());
        let writer = BackupWriter::new(store.clone());
        assert!(writer.write("p.1", &events("Analyse")).await.unwrap().changed);
        assert!(!writer.write("p.1", &events("Analyse")).await.unwrap().changed);
        assert!(writer.write("p.1", &events("Algèbre")).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_rapid_writes_coalesce_to_latest_payload() {
        let store = Arc::new(MemoryRefreshStore::new());
        let writer = Arc::new(ThrottledBackupWriter::new(
            BackupWriter::new(store.clone()),
            &BackupConfig {
                min_write_spacing_seconds: 0,
                max_tracked_keys: 10,
            },
        ));

        assert_eq!(
            writer.schedule_planning_backup_write("p.1", events("v1")),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            writer.schedule_planning_backup_write("p.1", events("v2")),
            ScheduleOutcome::Coalesced
        );
        assert_eq!(
            writer.schedule_planning_backup_write("p.1", events("v3")),
            ScheduleOutcome::Coalesced
        );
        wait_for_flushes(&writer).await;

        let backup = store.get_backup("p.1").await.unwrap().unwrap();
        assert_eq!(backup.events[0].summary, "v3");
        assert!(store.backup_upsert_count() <= 2);
    }

    #[tokio::test]
    async fn test_new_keys_are_rejected_when_full() {
        let store = Arc::new(MemoryRefreshStore::new());
        let writer = Arc::new(ThrottledBackupWriter::new(
            BackupWriter::new(store.clone()),
            &BackupConfig {
                min_write_spacing_seconds: 30,
                max_tracked_keys: 2,
            },
        ));
        assert_eq!(
            writer.schedule_planning_backup_write("a", events("x")),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            writer.schedule_planning_backup_write("b", events("x")),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            writer.schedule_planning_backup_write("c", events("x")),
            ScheduleOutcome::Rejected
        );
        wait_for_flushes(&writer).await;

        // Written keys stay tracked until their spacing elapses
        assert_eq!(
            writer.schedule_planning_backup_write("c", events("x")),
            ScheduleOutcome::Rejected
        );
        assert_eq!(writer.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn test_spacing_delays_second_write() {
        let store = Arc::new(MemoryRefreshStore::new());
        let writer = Arc::new(ThrottledBackupWriter::new(
            BackupWriter::new(store.clone()),
            &BackupConfig {
                min_write_spacing_seconds: 30,
                max_tracked_keys: 10,
            },
        ));
        writer.schedule_planning_backup_write("p.1", events("v1"));
        wait_for_flushes(&writer).await;
        assert_eq!(store.backup_upsert_count(), 1);

        assert_eq!(
            writer.schedule_planning_backup_write("p.1", events("v2")),
            ScheduleOutcome::Scheduled
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.backup_upsert_count(), 1);
        assert_eq!(writer.pending_flushes(), 1);
    }
}
