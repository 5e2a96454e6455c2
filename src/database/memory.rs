//! In-memory [`RefreshStore`].
//!
//! One mutex guards all tables, so every trait method is atomic the way a single SQL
//! statement is; a claim therefore behaves like `FOR UPDATE SKIP LOCKED` with no
//! concurrent lockers. Used by the integration tests and by single-process embeddings.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::store::{ClaimRequest, RefreshStore, SnapshotRequest};
use crate::constants::error_markers;
use crate::error::{RefreshError, Result};
use crate::models::{
    BackupRecord, CalendarEvent, ClaimedEntry, EnqueueOutcome, FailureRecord, OpsSnapshot,
    PendingEntrySummary, PlanningId, PlanningRef, RefreshState, StalenessBuckets, WorkQueueEntry,
};
use crate::queue::merge::{apply_plan, plan_batch, plan_single, MergePlan};

#[derive(Debug, Default)]
struct Tables {
    plannings: BTreeMap<PlanningId, String>,
    queue: HashMap<PlanningId, WorkQueueEntry>,
    states: HashMap<PlanningId, RefreshState>,
    backups: HashMap<PlanningId, BackupRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryRefreshStore {
    tables: Mutex<Tables>,
    backup_upserts: AtomicU64,
    failing_backup_writes: AtomicUsize,
}

impl MemoryRefreshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backup upserts that reached the store, changed or not
    pub fn backup_upsert_count(&self) -> u64 {
        self.backup_upserts.load(Ordering::SeqCst)
    }

    /// Make the next `count` backup upserts fail with a database error
    pub fn fail_next_backup_writes(&self, count: usize) {
        self.failing_backup_writes.store(count, Ordering::SeqCst);
    }

    pub fn queue_len(&self) -> usize {
        self.tables.lock().queue.len()
    }

    /// Insert a raw queue row, bypassing merge rules
    pub fn insert_raw_entry(&self, entry: WorkQueueEntry) {
        self.tables
            .lock()
            .queue
            .insert(entry.planning_id.clone(), entry);
    }

    /// Overwrite a backup's `refreshed_at`
    pub fn set_backup_refreshed_at(&self, planning_id: &str, refreshed_at: DateTime<Utc>) {
        if let Some(backup) = self.tables.lock().backups.get_mut(planning_id) {
            backup.refreshed_at = refreshed_at;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_backup_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

fn is_disabled(
    states: &HashMap<PlanningId, RefreshState>,
    planning_id: &str,
    now: DateTime<Utc>,
) -> bool {
    states
        .get(planning_id)
        .is_some_and(|state| state.is_disabled_at(now))
}

#[async_trait]
impl RefreshStore for MemoryRefreshStore {
    async fn upsert_planning(&self, planning: &PlanningRef) -> Result<()> {
        self.tables
            .lock()
            .plannings
            .insert(planning.id.clone(), planning.url.clone());
        Ok(())
    }

    async fn get_planning(&self, planning_id: &str) -> Result<Option<PlanningRef>> {
        Ok(self
            .tables
            .lock()
            .plannings
            .get(planning_id)
            .map(|url| PlanningRef::new(planning_id, url.clone())))
    }

    async fn enqueue(
        &self,
        planning_id: &str,
        priority: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut tables = self.tables.lock();
        let plan = plan_single(tables.queue.get(planning_id), priority, next_attempt_at, now);
        let outcome = match plan {
            MergePlan::Insert { .. } => EnqueueOutcome::Inserted,
            MergePlan::Merge { .. } => EnqueueOutcome::Merged,
            MergePlan::Revive { .. } => EnqueueOutcome::Revived,
            MergePlan::Skip => return Ok(EnqueueOutcome::Skipped),
        };
        let inserted = apply_plan(plan, planning_id, tables.queue.get_mut(planning_id), now);
        if let Some(row) = inserted {
            tables.queue.insert(planning_id.to_string(), row);
        }
        Ok(outcome)
    }

    async fn enqueue_batch(
        &self,
        planning_ids: &[PlanningId],
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let mut touched = 0;
        for planning_id in planning_ids {
            let plan = plan_batch(tables.queue.get(planning_id), priority, now);
            if plan == MergePlan::Skip {
                continue;
            }
            let inserted = apply_plan(plan, planning_id, tables.queue.get_mut(planning_id), now);
            if let Some(row) = inserted {
                tables.queue.insert(planning_id.clone(), row);
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<ClaimedEntry>> {
        let mut tables = self.tables.lock();
        let cutoff = request.lease_cutoff();

        let mut eligible: Vec<(i32, DateTime<Utc>, PlanningId)> = tables
            .queue
            .values()
            .filter(|entry| {
                entry.next_attempt_at <= request.now
                    && entry.attempts < request.max_attempts
                    && entry.locked_at.map_or(true, |locked_at| locked_at < cutoff)
                    && !entry.is_terminal()
                    && !is_disabled(&tables.states, &entry.planning_id, request.now)
            })
            .map(|entry| (entry.priority, entry.requested_at, entry.planning_id.clone()))
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        eligible.truncate(request.limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, planning_id) in eligible {
            let url = tables.plannings.get(&planning_id).cloned();
            if let Some(entry) = tables.queue.get_mut(&planning_id) {
                entry.locked_at = Some(request.now);
                entry.lock_owner = Some(request.owner.clone());
                entry.attempts += 1;
                entry.updated_at = request.now;
                claimed.push(ClaimedEntry {
                    planning_id,
                    url,
                    priority: entry.priority,
                    attempts: entry.attempts,
                    requested_at: entry.requested_at,
                });
            }
        }
        Ok(claimed)
    }

    async fn requeue(
        &self,
        planning_id: &str,
        owner: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.queue.get_mut(planning_id) {
            Some(entry) if entry.lock_owner.as_deref() == Some(owner) => {
                entry.locked_at = None;
                entry.lock_owner = None;
                entry.last_error = Some(last_error.to_string());
                entry.next_attempt_at = next_attempt_at;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(
        &self,
        planning_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.queue.get_mut(planning_id) {
            Some(entry) if entry.lock_owner.as_deref() == Some(owner) => {
                entry.locked_at = None;
                entry.lock_owner = None;
                entry.attempts = (entry.attempts - 1).max(0);
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_entry(&self, planning_id: &str) -> Result<bool> {
        Ok(self.tables.lock().queue.remove(planning_id).is_some())
    }

    async fn get_entry(&self, planning_id: &str) -> Result<Option<WorkQueueEntry>> {
        Ok(self.tables.lock().queue.get(planning_id).cloned())
    }

    async fn take_exhausted(&self, max_attempts: i32, limit: i64) -> Result<Vec<WorkQueueEntry>> {
        let mut tables = self.tables.lock();
        let mut exhausted: Vec<WorkQueueEntry> = tables
            .queue
            .values()
            .filter(|entry| entry.attempts >= max_attempts)
            .cloned()
            .collect();
        exhausted.sort_by_key(|entry| entry.updated_at);
        exhausted.truncate(limit.max(0) as usize);
        for entry in &exhausted {
            tables.queue.remove(&entry.planning_id);
        }
        Ok(exhausted)
    }

    async fn record_success(&self, planning_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.tables
            .lock()
            .states
            .entry(planning_id.to_string())
            .or_insert_with(|| RefreshState::new(planning_id))
            .apply_success(at);
        Ok(())
    }

    async fn record_failure(&self, planning_id: &str, failure: &FailureRecord) -> Result<()> {
        self.tables
            .lock()
            .states
            .entry(planning_id.to_string())
            .or_insert_with(|| RefreshState::new(planning_id))
            .apply_failure(failure);
        Ok(())
    }

    async fn clear_disable(&self, planning_id: &str) -> Result<()> {
        if let Some(state) = self.tables.lock().states.get_mut(planning_id) {
            state.disabled_until = None;
            state.consecutive_failures = 0;
        }
        Ok(())
    }

    async fn get_refresh_state(&self, planning_id: &str) -> Result<Option<RefreshState>> {
        Ok(self.tables.lock().states.get(planning_id).cloned())
    }

    async fn backfill_candidates(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PlanningId>> {
        let tables = self.tables.lock();
        let mut candidates: Vec<(Option<DateTime<Utc>>, &PlanningId)> = tables
            .plannings
            .keys()
            .filter(|id| !is_disabled(&tables.states, id, now))
            .filter_map(|id| match tables.backups.get(id) {
                None => Some((None, id)),
                Some(backup) if backup.refreshed_at < stale_before => {
                    Some((Some(backup.refreshed_at), id))
                }
                Some(_) => None,
            })
            .collect();
        // None sorts first, matching NULLS FIRST
        candidates.sort();
        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn get_backup(&self, planning_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.tables.lock().backups.get(planning_id).cloned())
    }

    async fn upsert_backup_if_changed(
        &self,
        planning_id: &str,
        events: &[CalendarEvent],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.backup_upserts.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(RefreshError::DatabaseError(
                "injected backup write failure".to_string(),
            ));
        }

        let mut tables = self.tables.lock();
        match tables.backups.get_mut(planning_id) {
            Some(backup) if backup.signature == signature => {
                backup.refreshed_at = now;
                Ok(false)
            }
            Some(backup) => {
                backup.events = events.to_vec();
                backup.signature = signature.to_string();
                backup.updated_at = now;
                backup.refreshed_at = now;
                Ok(true)
            }
            None => {
                tables.backups.insert(
                    planning_id.to_string(),
                    BackupRecord {
                        planning_id: planning_id.to_string(),
                        events: events.to_vec(),
                        signature: signature.to_string(),
                        updated_at: now,
                        refreshed_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn ops_snapshot(&self, request: SnapshotRequest) -> Result<OpsSnapshot> {
        let tables = self.tables.lock();
        let now = request.now;
        let lease_ttl: Duration = request.lease_ttl;

        let mut snapshot = OpsSnapshot {
            queue_depth: tables.queue.len() as i64,
            taken_at: now,
            ..OpsSnapshot::default()
        };
        for entry in tables.queue.values() {
            let fresh_lease = entry.has_fresh_lease(now, lease_ttl);
            if fresh_lease {
                snapshot.locked += 1;
            }
            if error_markers::is_terminal(entry.last_error.as_deref()) {
                snapshot.terminal += 1;
            } else if !fresh_lease
                && entry.next_attempt_at <= now
                && entry.attempts < request.max_attempts
                && !is_disabled(&tables.states, &entry.planning_id, now)
            {
                snapshot.ready += 1;
            }
        }
        snapshot.disabled = tables
            .states
            .values()
            .filter(|state| state.is_disabled_at(now))
            .count() as i64;

        let mut staleness = StalenessBuckets::default();
        for id in tables.plannings.keys() {
            staleness.record(tables.backups.get(id).map(|b| b.refreshed_at), now);
        }
        snapshot.staleness = staleness;

        let mut pending: Vec<&WorkQueueEntry> = tables
            .queue
            .values()
            .filter(|entry| !entry.has_fresh_lease(now, lease_ttl))
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.requested_at.cmp(&b.requested_at))
        });
        snapshot.top_pending = pending
            .into_iter()
            .take(request.top_n.max(0) as usize)
            .map(|entry| PendingEntrySummary {
                planning_id: entry.planning_id.clone(),
                priority: entry.priority,
                attempts: entry.attempts,
                next_attempt_at: entry.next_attempt_at,
                last_error: entry.last_error.clone(),
            })
            .collect();

        Ok(snapshot)
    }
}
