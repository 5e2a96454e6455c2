//! # PostgreSQL Refresh Store
//!
//! Production [`RefreshStore`] on `sqlx`.
//!
//! ## Claiming
//!
//! A claim is one statement: a `FOR UPDATE OF q SKIP LOCKED` selection feeding an
//! `UPDATE … RETURNING`. Concurrent claimers skip each other's candidate rows instead of
//! blocking, and the lease columns are written in the same statement, so two workers never
//! return the same row while its lease is fresh.
//!
//! ## Enqueue
//!
//! Single-item enqueue locks the existing row, asks [`plan_single`] what to do and applies
//! the answer in the same transaction. Batch enqueue is a single `INSERT … ON CONFLICT DO
//! UPDATE … WHERE` that mirrors [`plan_batch`](crate::queue::merge::plan_batch).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

use super::store::{ClaimRequest, RefreshStore, SnapshotRequest};
use crate::constants::{error_markers, priority};
use crate::error::{RefreshError, Result};
use crate::models::{
    BackupRecord, CalendarEvent, ClaimedEntry, EnqueueOutcome, FailureRecord, OpsSnapshot,
    PendingEntrySummary, PlanningId, PlanningRef, RefreshState, StalenessBuckets, WorkQueueEntry,
};
use crate::queue::merge::{plan_single, MergePlan};

/// Inserts that lose a race against a concurrent insert are retried this many times
const ENQUEUE_RACE_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct PgRefreshStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct BackupRow {
    planning_id: String,
    events: Json<Vec<CalendarEvent>>,
    signature: String,
    updated_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
}

impl From<BackupRow> for BackupRecord {
    fn from(row: BackupRow) -> Self {
        Self {
            planning_id: row.planning_id,
            events: row.events.0,
            signature: row.signature,
            updated_at: row.updated_at,
            refreshed_at: row.refreshed_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct QueueCounts {
    queue_depth: i64,
    ready: i64,
    locked: i64,
    terminal: i64,
}

fn permanent_pattern() -> String {
    format!("{}%", error_markers::PERMANENT)
}

fn max_attempts_pattern() -> String {
    format!("{}%", error_markers::MAX_ATTEMPTS)
}

impl PgRefreshStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_enqueue(
        &self,
        planning_id: &str,
        priority: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<EnqueueOutcome>> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, WorkQueueEntry>(
            "SELECT * FROM refresh_queue WHERE planning_id = $1 FOR UPDATE",
        )
        .bind(planning_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match plan_single(existing.as_ref(), priority, next_attempt_at, now) {
            MergePlan::Skip => EnqueueOutcome::Skipped,
            MergePlan::Insert {
                priority,
                next_attempt_at,
            } => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO refresh_queue
                        (planning_id, priority, requested_at, next_attempt_at, attempts, updated_at)
                    VALUES ($1, $2, $3, $4, 0, $3)
                    ON CONFLICT (planning_id) DO NOTHING
                    "#,
                )
                .bind(planning_id)
                .bind(priority)
                .bind(now)
                .bind(next_attempt_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if inserted == 0 {
                    // A concurrent enqueue inserted first; retry as a merge
                    tx.rollback().await?;
                    return Ok(None);
                }
                EnqueueOutcome::Inserted
            }
            MergePlan::Merge {
                priority,
                next_attempt_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE refresh_queue
                    SET priority = $2, next_attempt_at = $3, updated_at = $4
                    WHERE planning_id = $1
                    "#,
                )
                .bind(planning_id)
                .bind(priority)
                .bind(next_attempt_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                EnqueueOutcome::Merged
            }
            MergePlan::Revive {
                priority,
                next_attempt_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE refresh_queue
                    SET priority = $2, next_attempt_at = $3, requested_at = $4, updated_at = $4,
                        attempts = 0, locked_at = NULL, lock_owner = NULL, last_error = NULL
                    WHERE planning_id = $1
                    "#,
                )
                .bind(planning_id)
                .bind(priority)
                .bind(next_attempt_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                EnqueueOutcome::Revived
            }
        };

        tx.commit().await?;
        Ok(Some(outcome))
    }
}

#[async_trait]
impl RefreshStore for PgRefreshStore {
    async fn upsert_planning(&self, planning: &PlanningRef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plannings (id, url) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET url = EXCLUDED.url, updated_at = NOW()
            "#,
        )
        .bind(&planning.id)
        .bind(&planning.url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_planning(&self, planning_id: &str) -> Result<Option<PlanningRef>> {
        let planning =
            sqlx::query_as::<_, PlanningRef>("SELECT id, url FROM plannings WHERE id = $1")
                .bind(planning_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(planning)
    }

    #[instrument(skip(self))]
    async fn enqueue(
        &self,
        planning_id: &str,
        priority: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        for _ in 0..ENQUEUE_RACE_RETRIES {
            if let Some(outcome) = self
                .try_enqueue(planning_id, priority, next_attempt_at, now)
                .await?
            {
                return Ok(outcome);
            }
        }
        Err(RefreshError::DatabaseError(format!(
            "enqueue of {planning_id} kept losing insert races"
        )))
    }

    #[instrument(skip(self, planning_ids), fields(count = planning_ids.len()))]
    async fn enqueue_batch(
        &self,
        planning_ids: &[PlanningId],
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if planning_ids.is_empty() {
            return Ok(0);
        }
        let touched = sqlx::query(
            r#"
            INSERT INTO refresh_queue AS q
                (planning_id, priority, requested_at, next_attempt_at, attempts, updated_at)
            SELECT id, LEAST($2, $6), $3, $3, 0, $3
            FROM UNNEST($1::text[]) AS ids(id)
            ON CONFLICT (planning_id) DO UPDATE
            SET priority = LEAST(GREATEST(q.priority, EXCLUDED.priority), $6),
                next_attempt_at = LEAST(q.next_attempt_at, EXCLUDED.next_attempt_at),
                updated_at = $3
            WHERE COALESCE(q.last_error, '') NOT LIKE $4
              AND COALESCE(q.last_error, '') NOT LIKE $5
            "#,
        )
        .bind(planning_ids)
        .bind(priority)
        .bind(now)
        .bind(permanent_pattern())
        .bind(max_attempts_pattern())
        .bind(priority::MAX)
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(touched, "Batch enqueue applied");
        Ok(touched)
    }

    #[instrument(skip(self, request), fields(owner = %request.owner, limit = request.limit))]
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<ClaimedEntry>> {
        let mut claimed = sqlx::query_as::<_, ClaimedEntry>(
            r#"
            WITH candidates AS (
                SELECT q.planning_id
                FROM refresh_queue q
                LEFT JOIN planning_refresh_state s ON s.planning_id = q.planning_id
                WHERE q.next_attempt_at <= $1
                  AND q.attempts < $2
                  AND (q.locked_at IS NULL OR q.locked_at < $3)
                  AND COALESCE(q.last_error, '') NOT LIKE $6
                  AND COALESCE(q.last_error, '') NOT LIKE $7
                  AND (s.disabled_until IS NULL OR s.disabled_until <= $1)
                ORDER BY q.priority DESC, q.requested_at ASC
                LIMIT $4
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE refresh_queue q
            SET locked_at = $1, lock_owner = $5, attempts = q.attempts + 1, updated_at = $1
            FROM candidates c
            WHERE q.planning_id = c.planning_id
            RETURNING q.planning_id,
                      (SELECT p.url FROM plannings p WHERE p.id = q.planning_id) AS url,
                      q.priority,
                      q.attempts,
                      q.requested_at
            "#,
        )
        .bind(request.now)
        .bind(request.max_attempts)
        .bind(request.lease_cutoff())
        .bind(request.limit)
        .bind(&request.owner)
        .bind(permanent_pattern())
        .bind(max_attempts_pattern())
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE ordering
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.requested_at.cmp(&b.requested_at))
        });
        debug!(claimed = claimed.len(), "Claimed queue rows");
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
        let updated = sqlx::query(
            r#"
            UPDATE refresh_queue
            SET locked_at = NULL, lock_owner = NULL, last_error = $3,
                next_attempt_at = $4, updated_at = $5
            WHERE planning_id = $1 AND lock_owner = $2
            "#,
        )
        .bind(planning_id)
        .bind(owner)
        .bind(last_error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn release_lease(
        &self,
        planning_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE refresh_queue
            SET locked_at = NULL, lock_owner = NULL,
                attempts = GREATEST(attempts - 1, 0), updated_at = $3
            WHERE planning_id = $1 AND lock_owner = $2
            "#,
        )
        .bind(planning_id)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn delete_entry(&self, planning_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM refresh_queue WHERE planning_id = $1")
            .bind(planning_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn get_entry(&self, planning_id: &str) -> Result<Option<WorkQueueEntry>> {
        let entry = sqlx::query_as::<_, WorkQueueEntry>(
            "SELECT * FROM refresh_queue WHERE planning_id = $1",
        )
        .bind(planning_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn take_exhausted(&self, max_attempts: i32, limit: i64) -> Result<Vec<WorkQueueEntry>> {
        let rows = sqlx::query_as::<_, WorkQueueEntry>(
            r#"
            DELETE FROM refresh_queue
            WHERE planning_id IN (
                SELECT planning_id FROM refresh_queue
                WHERE attempts >= $1
                ORDER BY updated_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_success(&self, planning_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO planning_refresh_state
                (planning_id, consecutive_failures, last_attempt_at, last_success_at)
            VALUES ($1, 0, $2, $2)
            ON CONFLICT (planning_id) DO UPDATE
            SET consecutive_failures = 0, disabled_until = NULL,
                last_attempt_at = $2, last_success_at = $2
            "#,
        )
        .bind(planning_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, planning_id: &str, failure: &FailureRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO planning_refresh_state AS s
                (planning_id, disabled_until, consecutive_failures, last_failure_kind,
                 last_error, last_attempt_at)
            VALUES ($1, $2, 1, $3, $4, $5)
            ON CONFLICT (planning_id) DO UPDATE
            SET consecutive_failures = s.consecutive_failures + 1,
                disabled_until = COALESCE(EXCLUDED.disabled_until, s.disabled_until),
                last_failure_kind = EXCLUDED.last_failure_kind,
                last_error = EXCLUDED.last_error,
                last_attempt_at = EXCLUDED.last_attempt_at
            "#,
        )
        .bind(planning_id)
        .bind(failure.disabled_until)
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(failure.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_disable(&self, planning_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE planning_refresh_state
            SET disabled_until = NULL, consecutive_failures = 0
            WHERE planning_id = $1
            "#,
        )
        .bind(planning_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_refresh_state(&self, planning_id: &str) -> Result<Option<RefreshState>> {
        let state = sqlx::query_as::<_, RefreshState>(
            "SELECT * FROM planning_refresh_state WHERE planning_id = $1",
        )
        .bind(planning_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    #[instrument(skip(self))]
    async fn backfill_candidates(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PlanningId>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT p.id
            FROM plannings p
            LEFT JOIN planning_backups b ON b.planning_id = p.id
            LEFT JOIN planning_refresh_state s ON s.planning_id = p.id
            WHERE (b.planning_id IS NULL OR b.refreshed_at < $1)
              AND (s.disabled_until IS NULL OR s.disabled_until <= $2)
            ORDER BY b.refreshed_at ASC NULLS FIRST, p.id ASC
            LIMIT $3
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_backup(&self, planning_id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT planning_id, events, signature, updated_at, refreshed_at
            FROM planning_backups WHERE planning_id = $1
            "#,
        )
        .bind(planning_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BackupRecord::from))
    }

    #[instrument(skip(self, events), fields(events = events.len()))]
    async fn upsert_backup_if_changed(
        &self,
        planning_id: &str,
        events: &[CalendarEvent],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // The CTE sees the row as it was before this statement
        let previous = sqlx::query_scalar::<_, Option<String>>(
            r#"
            WITH previous AS (
                SELECT signature FROM planning_backups WHERE planning_id = $1
            )
            INSERT INTO planning_backups AS b
                (planning_id, events, signature, updated_at, refreshed_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (planning_id) DO UPDATE
            SET events = CASE WHEN b.signature IS DISTINCT FROM EXCLUDED.signature
                              THEN EXCLUDED.events ELSE b.events END,
                updated_at = CASE WHEN b.signature IS DISTINCT FROM EXCLUDED.signature
                                  THEN EXCLUDED.updated_at ELSE b.updated_at END,
                signature = EXCLUDED.signature,
                refreshed_at = EXCLUDED.refreshed_at
            RETURNING (SELECT signature FROM previous)
            "#,
        )
        .bind(planning_id)
        .bind(Json(events))
        .bind(signature)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(previous.as_deref() != Some(signature))
    }

    async fn ops_snapshot(&self, request: SnapshotRequest) -> Result<OpsSnapshot> {
        let now = request.now;
        let lease_cutoff = now - request.lease_ttl;

        let counts = sqlx::query_as::<_, QueueCounts>(
            r#"
            SELECT
                COUNT(*) AS queue_depth,
                COUNT(*) FILTER (
                    WHERE q.next_attempt_at <= $1
                      AND q.attempts < $3
                      AND (q.locked_at IS NULL OR q.locked_at < $2)
                      AND COALESCE(q.last_error, '') NOT LIKE $4
                      AND COALESCE(q.last_error, '') NOT LIKE $5
                      AND (s.disabled_until IS NULL OR s.disabled_until <= $1)
                ) AS ready,
                COUNT(*) FILTER (WHERE q.locked_at >= $2) AS locked,
                COUNT(*) FILTER (
                    WHERE q.last_error LIKE $4 OR q.last_error LIKE $5
                ) AS terminal
            FROM refresh_queue q
            LEFT JOIN planning_refresh_state s ON s.planning_id = q.planning_id
            "#,
        )
        .bind(now)
        .bind(lease_cutoff)
        .bind(request.max_attempts)
        .bind(permanent_pattern())
        .bind(max_attempts_pattern())
        .fetch_one(&self.pool)
        .await?;

        let disabled = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM planning_refresh_state WHERE disabled_until > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let staleness = sqlx::query_as::<_, StalenessBuckets>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE b.refreshed_at >= $1) AS under_1h,
                COUNT(*) FILTER (WHERE b.refreshed_at < $1 AND b.refreshed_at >= $2)
                    AS from_1h_to_6h,
                COUNT(*) FILTER (WHERE b.refreshed_at < $2 AND b.refreshed_at >= $3)
                    AS from_6h_to_24h,
                COUNT(*) FILTER (WHERE b.refreshed_at < $3) AS over_24h,
                COUNT(*) FILTER (WHERE b.refreshed_at IS NULL) AS never
            FROM plannings p
            LEFT JOIN planning_backups b ON b.planning_id = p.id
            "#,
        )
        .bind(now - Duration::hours(1))
        .bind(now - Duration::hours(6))
        .bind(now - Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;

        let top_pending = sqlx::query_as::<_, PendingEntrySummary>(
            r#"
            SELECT planning_id, priority, attempts, next_attempt_at, last_error
            FROM refresh_queue
            WHERE locked_at IS NULL OR locked_at < $1
            ORDER BY priority DESC, requested_at ASC
            LIMIT $2
            "#,
        )
        .bind(lease_cutoff)
        .bind(request.top_n)
        .fetch_all(&self.pool)
        .await?;

        Ok(OpsSnapshot {
            queue_depth: counts.queue_depth,
            ready: counts.ready,
            locked: counts.locked,
            terminal: counts.terminal,
            disabled,
            staleness,
            top_pending,
            taken_at: now,
        })
    }
}
