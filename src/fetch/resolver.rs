//! Read-through events resolution.
//!
//! [`EventsResolver::resolve_events`] never fails: it returns what the network or the backup
//! store could provide, tagged with where it came from. Concurrent network reads of the same
//! planning and range share one upstream fetch through the coalescer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::fetcher::{FetchResult, UpstreamFetcher};
use super::failure::FetchFailure;
use super::template::has_placeholders;
use crate::backup::ThrottledBackupWriter;
use crate::database::RefreshStore;
use crate::models::{CalendarEvent, DateRange, PlanningId, PlanningRef};
use crate::resilience::InFlightCoalescer;

/// Where resolved events came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Db,
    Network,
    None,
}

/// Why a resolution returned no events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Upstream failed and no backup exists
    NetworkError,
    /// Nothing was available and the network was not the cause
    NoData,
    /// A source answered, with zero events
    EmptySchedule,
}

/// Derive the failure reason from provenance and event count
pub fn failure_reason(
    source: EventSource,
    network_failed: bool,
    event_count: usize,
) -> Option<FailureReason> {
    if event_count > 0 {
        return None;
    }
    match source {
        EventSource::None if network_failed => Some(FailureReason::NetworkError),
        EventSource::None => Some(FailureReason::NoData),
        EventSource::Db | EventSource::Network => Some(FailureReason::EmptySchedule),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvents {
    pub events: Vec<CalendarEvent>,
    pub source: EventSource,
    pub network_failed: bool,
    pub backup_refreshed_at: Option<DateTime<Utc>>,
    pub backup_updated_at: Option<DateTime<Utc>>,
    pub network_failure: Option<FetchFailure>,
}

impl ResolvedEvents {
    fn empty(network_failure: Option<FetchFailure>) -> Self {
        Self {
            events: Vec::new(),
            source: EventSource::None,
            network_failed: network_failure.is_some(),
            backup_refreshed_at: None,
            backup_updated_at: None,
            network_failure,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        failure_reason(self.source, self.network_failed, self.events.len())
    }
}

type CoalescingKey = (PlanningId, Option<DateRange>);

pub struct EventsResolver {
    fetcher: Arc<UpstreamFetcher>,
    store: Arc<dyn RefreshStore>,
    coalescer: InFlightCoalescer<CoalescingKey, FetchResult>,
    backup_writer: Option<Arc<ThrottledBackupWriter>>,
}

impl EventsResolver {
    pub fn new(
        fetcher: Arc<UpstreamFetcher>,
        store: Arc<dyn RefreshStore>,
        max_in_flight_keys: usize,
    ) -> Self {
        Self {
            fetcher,
            store,
            coalescer: InFlightCoalescer::new(max_in_flight_keys),
            backup_writer: None,
        }
    }

    /// Persist full-window network results through the throttled writer
    pub fn with_backup_writer(mut self, writer: Arc<ThrottledBackupWriter>) -> Self {
        self.backup_writer = Some(writer);
        self
    }

    pub fn in_flight_count(&self) -> usize {
        self.coalescer.in_flight_count()
    }

    /// Resolve the events of a planning
    ///
    /// With `only_db`, only the backup store is read. Otherwise the upstream is fetched
    /// (coalesced per planning and range) and the backup is the fallback.
    pub async fn resolve_events(
        &self,
        planning: &PlanningRef,
        only_db: bool,
        range: Option<DateRange>,
    ) -> ResolvedEvents {
        if only_db {
            return self.from_backup(&planning.id, range, None).await;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let url = planning.url.clone();
        let result = self
            .coalescer
            .run((planning.id.clone(), range), move || async move {
                fetcher.fetch_events(&url, range).await
            })
            .await;

        match result {
            Ok(events) => {
                let full_window = range.is_none() || !has_placeholders(&planning.url);
                if full_window {
                    if let Some(writer) = &self.backup_writer {
                        writer
                            .schedule_planning_backup_write(&planning.id, events.as_ref().clone());
                    }
                }
                let events = match (range, has_placeholders(&planning.url)) {
                    (Some(range), false) => filter_by_range(&events, &range),
                    _ => events.as_ref().clone(),
                };
                debug!(planning_id = %planning.id, events = events.len(), "Resolved from network");
                ResolvedEvents {
                    events,
                    source: EventSource::Network,
                    network_failed: false,
                    backup_refreshed_at: None,
                    backup_updated_at: None,
                    network_failure: None,
                }
            }
            Err(failure) => {
                debug!(
                    planning_id = %planning.id,
                    kind = %failure.kind,
                    "Network failed, falling back to backup"
                );
                self.from_backup(&planning.id, range, Some(failure)).await
            }
        }
    }

    async fn from_backup(
        &self,
        planning_id: &str,
        range: Option<DateRange>,
        network_failure: Option<FetchFailure>,
    ) -> ResolvedEvents {
        let backup = match self.store.get_backup(planning_id).await {
            Ok(backup) => backup,
            Err(error) => {
                warn!(planning_id, error = %error, "Backup read failed");
                None
            }
        };

        let Some(backup) = backup else {
            return ResolvedEvents::empty(network_failure);
        };
        let events = match range {
            Some(range) => filter_by_range(&backup.events, &range),
            None => backup.events,
        };
        ResolvedEvents {
            events,
            source: EventSource::Db,
            network_failed: network_failure.is_some(),
            backup_refreshed_at: Some(backup.refreshed_at),
            backup_updated_at: Some(backup.updated_at),
            network_failure,
        }
    }
}

fn filter_by_range(events: &[CalendarEvent], range: &DateRange) -> Vec<CalendarEvent> {
    events
        .iter()
        .filter(|event| event.overlaps(range))
        .cloned()
        .collect()
}
