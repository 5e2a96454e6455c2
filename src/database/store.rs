//! Persistence seam of the refresh pipeline.
//!
//! Every database access of the queue, the worker, the backfill scanner and the backup writer
//! goes through [`RefreshStore`]. [`PgRefreshStore`](super::PgRefreshStore) is the production
//! implementation; [`MemoryRefreshStore`](super::MemoryRefreshStore) mirrors its semantics
//! for tests and single-process embeddings.
//!
//! All timestamps are passed in by the caller so the same `now` governs a whole operation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{
    BackupRecord, CalendarEvent, ClaimedEntry, EnqueueOutcome, FailureRecord, OpsSnapshot,
    PlanningId, PlanningRef, RefreshState, WorkQueueEntry,
};

/// Parameters of one atomic claim
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Written into `lock_owner`
    pub owner: String,
    pub limit: i64,
    /// Rows at or above this attempt count are not eligible
    pub max_attempts: i32,
    /// Leases older than this are treated as abandoned
    pub lease_ttl: Duration,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    /// Leases taken before this instant are expired
    pub fn lease_cutoff(&self) -> DateTime<Utc> {
        self.now - self.lease_ttl
    }
}

/// Parameters of an operational snapshot
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest {
    pub now: DateTime<Utc>,
    pub lease_ttl: Duration,
    pub max_attempts: i32,
    pub top_n: i64,
}

#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Register a planning or update its feed URL
    async fn upsert_planning(&self, planning: &PlanningRef) -> Result<()>;

    async fn get_planning(&self, planning_id: &str) -> Result<Option<PlanningRef>>;

    /// Insert-or-merge one row following [`plan_single`](crate::queue::merge::plan_single)
    async fn enqueue(
        &self,
        planning_id: &str,
        priority: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;

    /// Insert-or-merge many rows following [`plan_batch`](crate::queue::merge::plan_batch);
    /// returns the number of rows inserted or merged
    async fn enqueue_batch(
        &self,
        planning_ids: &[PlanningId],
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Atomically lease up to `limit` eligible rows, skipping rows locked by a concurrent claim
    ///
    /// Returned entries carry the post-increment attempt count and are ordered by priority
    /// descending, then request time ascending.
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<ClaimedEntry>>;

    /// Clear the lease and reschedule; only applies while `owner` still holds the lease
    async fn requeue(
        &self,
        planning_id: &str,
        owner: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clear the lease of a claimed row that was never processed, returning the attempt its
    /// claim consumed; the schedule is left as is
    async fn release_lease(&self, planning_id: &str, owner: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Remove the row; deleting an absent row is not an error
    async fn delete_entry(&self, planning_id: &str) -> Result<bool>;

    async fn get_entry(&self, planning_id: &str) -> Result<Option<WorkQueueEntry>>;

    /// Delete up to `limit` rows stuck at `attempts >= max_attempts`, returning them
    async fn take_exhausted(&self, max_attempts: i32, limit: i64) -> Result<Vec<WorkQueueEntry>>;

    async fn record_success(&self, planning_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn record_failure(&self, planning_id: &str, failure: &FailureRecord) -> Result<()>;

    /// Manual override: lift the disable window and reset the failure streak
    async fn clear_disable(&self, planning_id: &str) -> Result<()>;

    async fn get_refresh_state(&self, planning_id: &str) -> Result<Option<RefreshState>>;

    /// Plannings with no backup or a backup confirmed before `stale_before`, excluding any
    /// inside a disable window; least recently refreshed first
    async fn backfill_candidates(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PlanningId>>;

    async fn get_backup(&self, planning_id: &str) -> Result<Option<BackupRecord>>;

    /// Store the snapshot when its signature differs from the stored one
    ///
    /// `refreshed_at` always moves to `now`; events and `updated_at` only on a change.
    /// Returns whether the content changed.
    async fn upsert_backup_if_changed(
        &self,
        planning_id: &str,
        events: &[CalendarEvent],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn ops_snapshot(&self, request: SnapshotRequest) -> Result<OpsSnapshot>;
}
