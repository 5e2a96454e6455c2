//! # Durable Work Queue
//!
//! Queue operations on top of [`RefreshStore`]: dedup enqueue, race-safe claim, and the
//! failure transitions (requeue with backoff, give-up, permanent short-circuit).
//!
//! A single item's failure never escapes as an error here: [`WorkQueue::fail`] always turns
//! it into a [`FailureDisposition`]. Only store failures surface as `Err`.
//!
//! ## Lease semantics
//!
//! `locked_at`/`lock_owner` form an advisory lease. A row whose lease outlived the TTL can be
//! claimed again while its first claimant is still running, so the same planning may be
//! processed twice. Every terminal action is idempotent (delete of an absent row, backup
//! upsert guarded by signature), which makes double processing harmless. Requeue and release
//! check the owner so a straggler cannot reschedule a row it no longer holds.

pub mod merge;

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::constants::error_markers;
use crate::database::{ClaimRequest, RefreshStore, SnapshotRequest};
use crate::error::Result;
use crate::fetch::{FailureKind, FetchFailure};
use crate::models::{ClaimedEntry, EnqueueOutcome, FailureRecord, OpsSnapshot, PlanningId};
use crate::resilience::{disable_window, BackoffPolicy};

/// What happened to a row after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Transient failure: lease cleared, rescheduled
    Requeued { next_attempt_at: DateTime<Utc> },
    /// Attempts exhausted: row deleted, planning disabled
    GaveUp { disabled_until: DateTime<Utc> },
    /// 4xx other than 429: row deleted on this attempt, planning disabled
    Permanent { disabled_until: DateTime<Utc> },
    /// The lease expired and another worker owns the row now; nothing was written
    LeaseLost,
}

impl FailureDisposition {
    /// Whether the row left the queue
    pub fn deleted(&self) -> bool {
        matches!(self, Self::GaveUp { .. } | Self::Permanent { .. })
    }
}

pub struct WorkQueue {
    store: Arc<dyn RefreshStore>,
    backoff: BackoffPolicy,
    max_attempts: i32,
    lease_ttl: Duration,
    sweep_batch_size: i64,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn RefreshStore>, config: &QueueConfig, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            backoff,
            max_attempts: config.max_attempts,
            lease_ttl: Duration::seconds(config.lease_ttl_seconds as i64),
            sweep_batch_size: config.sweep_batch_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn RefreshStore> {
        &self.store
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Insert-or-merge one planning, eligible immediately
    pub async fn enqueue(&self, planning_id: &str, priority: i32) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let outcome = self.store.enqueue(planning_id, priority, now, now).await?;
        debug!(planning_id, priority, outcome = ?outcome, "Enqueued planning");
        Ok(outcome)
    }

    /// Insert-or-merge many plannings; settled rows are left frozen
    pub async fn enqueue_batch(&self, planning_ids: &[PlanningId], priority: i32) -> Result<u64> {
        self.store
            .enqueue_batch(planning_ids, priority, Utc::now())
            .await
    }

    /// Lease up to `limit` eligible rows for `owner`
    pub async fn claim(&self, owner: &str, limit: i64) -> Result<Vec<ClaimedEntry>> {
        self.store
            .claim(&ClaimRequest {
                owner: owner.to_string(),
                limit,
                max_attempts: self.max_attempts,
                lease_ttl: self.lease_ttl,
                now: Utc::now(),
            })
            .await
    }

    /// Successful refresh: drop the row
    pub async fn complete(&self, planning_id: &str) -> Result<bool> {
        self.store.delete_entry(planning_id).await
    }

    /// Give back the lease of a row that was claimed but never processed
    ///
    /// The claim's attempt is refunded, so a row claimed on its last attempt stays claimable.
    pub async fn release(&self, planning_id: &str, owner: &str) -> Result<bool> {
        self.store
            .release_lease(planning_id, owner, Utc::now())
            .await
    }

    /// Fold a failed attempt into the queue and the planning's refresh state
    #[instrument(
        skip(self, entry, failure),
        fields(planning_id = %entry.planning_id, attempt = entry.attempts, kind = %failure.kind)
    )]
    pub async fn fail(
        &self,
        entry: &ClaimedEntry,
        owner: &str,
        failure: &FetchFailure,
    ) -> Result<FailureDisposition> {
        let now = Utc::now();

        if failure.is_permanent() {
            let disabled_until = now + disable_window(Some(failure.kind), failure.status);
            self.settle(entry, failure, error_markers::PERMANENT, disabled_until, now)
                .await?;
            warn!(disabled_until = %disabled_until, "Permanent upstream failure, row deleted");
            return Ok(FailureDisposition::Permanent { disabled_until });
        }

        if entry.attempts >= self.max_attempts {
            let disabled_until = now + disable_window(Some(failure.kind), failure.status);
            self.settle(entry, failure, error_markers::MAX_ATTEMPTS, disabled_until, now)
                .await?;
            warn!(
                max_attempts = self.max_attempts,
                disabled_until = %disabled_until,
                "Attempts exhausted, row given up"
            );
            return Ok(FailureDisposition::GaveUp { disabled_until });
        }

        let next_attempt_at = self.backoff.next_attempt_at(entry.attempts, failure, now);
        let requeued = self
            .store
            .requeue(
                &entry.planning_id,
                owner,
                next_attempt_at,
                &failure.describe(),
                now,
            )
            .await?;
        if !requeued {
            warn!("Lease lost before requeue, leaving row to its new owner");
            return Ok(FailureDisposition::LeaseLost);
        }

        self.store
            .record_failure(
                &entry.planning_id,
                &FailureRecord {
                    kind: failure.kind,
                    message: failure.describe(),
                    disabled_until: None,
                    at: now,
                },
            )
            .await?;
        debug!(
            delay_ms = (next_attempt_at - now).num_milliseconds(),
            "Requeued with backoff"
        );
        Ok(FailureDisposition::Requeued { next_attempt_at })
    }

    async fn settle(
        &self,
        entry: &ClaimedEntry,
        failure: &FetchFailure,
        marker: &str,
        disabled_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.delete_entry(&entry.planning_id).await?;
        self.store
            .record_failure(
                &entry.planning_id,
                &FailureRecord {
                    kind: failure.kind,
                    message: format!("{marker} {}", failure.describe()),
                    disabled_until: Some(disabled_until),
                    at: now,
                },
            )
            .await
    }

    /// Migrate rows stuck at the attempt limit into refresh state and delete them
    ///
    /// Bounded by `sweep_batch_size` per call; returns the number of rows migrated.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<usize> {
        let exhausted = self
            .store
            .take_exhausted(self.max_attempts, self.sweep_batch_size)
            .await?;
        let now = Utc::now();

        for entry in &exhausted {
            let (kind, status) = failure_from_last_error(entry.last_error.as_deref());
            let disabled_until = now + disable_window(kind, status);
            let message = format!(
                "{} {}",
                error_markers::MAX_ATTEMPTS,
                entry.last_error.as_deref().unwrap_or("swept without recorded error")
            );
            self.store
                .record_failure(
                    &entry.planning_id,
                    &FailureRecord {
                        kind: kind.unwrap_or(FailureKind::NetworkError),
                        message,
                        disabled_until: Some(disabled_until),
                        at: now,
                    },
                )
                .await?;
        }

        if !exhausted.is_empty() {
            info!(swept = exhausted.len(), "Swept exhausted queue rows");
        }
        Ok(exhausted.len())
    }

    pub async fn snapshot(&self, top_n: i64) -> Result<OpsSnapshot> {
        self.store
            .ops_snapshot(SnapshotRequest {
                now: Utc::now(),
                lease_ttl: self.lease_ttl,
                max_attempts: self.max_attempts,
                top_n,
            })
            .await
    }
}

/// Recover kind and status from a stored `last_error` such as
/// `permanent: http_4xx: [404] Not Found`
pub fn failure_from_last_error(last_error: Option<&str>) -> (Option<FailureKind>, Option<u16>) {
    let Some(mut text) = last_error.map(str::trim) else {
        return (None, None);
    };
    for marker in error_markers::TERMINAL {
        if let Some(rest) = text.strip_prefix(marker) {
            text = rest.trim_start();
        }
    }

    let Some((kind, rest)) = text.split_once(':') else {
        return (text.parse().ok(), None);
    };
    let status = rest
        .trim_start()
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .and_then(|(status, _)| status.parse().ok());
    (kind.trim().parse().ok(), status)
}
