//! # Refresh Worker
//!
//! Drains the work queue. One drain claims a batch and runs `lanes` concurrent lanes over it,
//! each lane pulling the next row from a shared cursor until the batch is exhausted or the
//! wall-clock budget runs out or shutdown is requested. Rows the lanes never reached, and
//! fetches cut short by shutdown, have their lease released.
//!
//! Every fetch holds a per-host permit, so no upstream host sees more than
//! `per_host_concurrency` requests from this worker at once.
//!
//! ```text
//! claim(batch) ──▶ lane 0 ─┐
//!                  lane 1 ─┼─▶ host permit ─▶ fetch ─▶ backup write ─▶ delete
//!                  lane N ─┘                    └──▶ fail() ─▶ requeue | give up | permanent
//! ```
//!
//! The poll loop doubles its idle wait after an empty drain, up to `max_idle`, and resets it
//! after any claim. A poke ends the idle wait at once.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::jobs::{BackgroundJob, JobContext, Wake};
use crate::backup::BackupWriter;
use crate::config::WorkerConfig;
use crate::constants::system::REFRESH_WORKER_JOB;
use crate::error::Result;
use crate::fetch::{upstream_host, FailureKind, FetchFailure, UpstreamFetcher};
use crate::models::ClaimedEntry;
use crate::queue::{FailureDisposition, WorkQueue};
use crate::resilience::HostSemaphore;

/// Host key for URLs without a parseable host
const UNKNOWN_HOST: &str = "unknown-host";

/// Counters of one drain, or totals across drains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub picked: u64,
    pub deleted: u64,
    pub requeued: u64,
    pub failed: u64,
    /// Claimed but not processed before the budget ran out or shutdown began
    pub released: u64,
}

#[derive(Debug, Default)]
struct DrainCounters {
    picked: AtomicU64,
    deleted: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
}

impl DrainCounters {
    fn add(&self, report: &DrainReport) {
        self.picked.fetch_add(report.picked, Ordering::Relaxed);
        self.deleted.fetch_add(report.deleted, Ordering::Relaxed);
        self.requeued.fetch_add(report.requeued, Ordering::Relaxed);
        self.failed.fetch_add(report.failed, Ordering::Relaxed);
        self.released.fetch_add(report.released, Ordering::Relaxed);
    }

    fn report(&self) -> DrainReport {
        DrainReport {
            picked: self.picked.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// What processing one claimed row did
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Refreshed,
    /// The planning has no registered URL anymore
    Orphaned,
    Failed(FailureDisposition),
    /// Shutdown began while the fetch was in flight
    Interrupted,
}

pub struct RefreshWorker {
    worker_id: String,
    queue: Arc<WorkQueue>,
    fetcher: Arc<UpstreamFetcher>,
    backup: BackupWriter,
    hosts: HostSemaphore,
    config: WorkerConfig,
    totals: DrainCounters,
}

impl RefreshWorker {
    pub fn new(
        queue: Arc<WorkQueue>,
        fetcher: Arc<UpstreamFetcher>,
        backup: BackupWriter,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("refresh-worker-{}", uuid::Uuid::new_v4()));
        Self {
            worker_id,
            queue,
            fetcher,
            backup,
            hosts: HostSemaphore::new(config.per_host_concurrency),
            config,
            totals: DrainCounters::default(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Totals across every drain of this worker
    pub fn totals(&self) -> DrainReport {
        self.totals.report()
    }

    /// Claim one batch and process it under the drain budget
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_until(&CancellationToken::new()).await
    }

    /// [`drain`](Self::drain) that stops taking rows, and abandons in-flight fetches, once
    /// `cancel` fires
    pub async fn drain_until(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let deadline = Instant::now() + self.config.drain_budget();
        let claimed = self
            .queue
            .claim(&self.worker_id, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(DrainReport::default());
        }

        let counters = DrainCounters::default();
        counters
            .picked
            .store(claimed.len() as u64, Ordering::Relaxed);
        let cursor = AtomicUsize::new(0);
        let lanes = self.config.lanes.clamp(1, claimed.len());

        let runs = (0..lanes)
            .map(|lane| self.run_lane(lane, &claimed, &cursor, deadline, cancel, &counters));
        join_all(runs).await;

        // Rows past the cursor were never started
        let reached = cursor.load(Ordering::SeqCst).min(claimed.len());
        for entry in &claimed[reached..] {
            self.release(entry, &counters).await;
        }

        let report = counters.report();
        self.totals.add(&report);
        debug!(
            worker_id = %self.worker_id,
            picked = report.picked,
            deleted = report.deleted,
            requeued = report.requeued,
            failed = report.failed,
            released = report.released,
            "Drain finished"
        );
        Ok(report)
    }

    async fn run_lane(
        &self,
        lane: usize,
        claimed: &[ClaimedEntry],
        cursor: &AtomicUsize,
        deadline: Instant,
        cancel: &CancellationToken,
        counters: &DrainCounters,
    ) {
        loop {
            if cancel.is_cancelled() {
                debug!(lane, "Drain interrupted by shutdown");
                return;
            }
            if Instant::now() >= deadline {
                debug!(lane, "Drain budget exhausted");
                return;
            }
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(entry) = claimed.get(index) else {
                return;
            };

            match self.process_item(entry, cancel).await {
                ItemOutcome::Interrupted => {
                    self.release(entry, counters).await;
                    return;
                }
                ItemOutcome::Refreshed | ItemOutcome::Orphaned => {
                    counters.deleted.fetch_add(1, Ordering::Relaxed);
                }
                ItemOutcome::Failed(disposition) => match disposition {
                    FailureDisposition::Requeued { .. } => {
                        counters.requeued.fetch_add(1, Ordering::Relaxed);
                    }
                    FailureDisposition::GaveUp { .. } | FailureDisposition::Permanent { .. } => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        counters.deleted.fetch_add(1, Ordering::Relaxed);
                    }
                    FailureDisposition::LeaseLost => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                },
            }

            let pacing = self.config.item_pacing();
            if !pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(pacing) => {}
                }
            }
        }
    }

    async fn release(&self, entry: &ClaimedEntry, counters: &DrainCounters) {
        match self.queue.release(&entry.planning_id, &self.worker_id).await {
            Ok(_) => {
                counters.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(
                    planning_id = %entry.planning_id,
                    error = %error,
                    "Lease release failed, leaving it to expire"
                );
            }
        }
    }

    /// Process one row; store errors become a generic transient failure of that row
    async fn process_item(&self, entry: &ClaimedEntry, cancel: &CancellationToken) -> ItemOutcome {
        match self.try_process_item(entry, cancel).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    planning_id = %entry.planning_id,
                    error = %error,
                    "Item processing failed, requeueing"
                );
                let failure =
                    FetchFailure::new(FailureKind::NetworkError, format!("internal: {error}"));
                match self.queue.fail(entry, &self.worker_id, &failure).await {
                    Ok(disposition) => ItemOutcome::Failed(disposition),
                    Err(error) => {
                        error!(
                            planning_id = %entry.planning_id,
                            error = %error,
                            "Requeue failed, lease will expire"
                        );
                        ItemOutcome::Failed(FailureDisposition::LeaseLost)
                    }
                }
            }
        }
    }

    async fn try_process_item(
        &self,
        entry: &ClaimedEntry,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let Some(url) = entry.url.as_deref() else {
            warn!(
                planning_id = %entry.planning_id,
                "Queued planning has no registered URL, dropping row"
            );
            self.queue.complete(&entry.planning_id).await?;
            return Ok(ItemOutcome::Orphaned);
        };

        let host = upstream_host(url).unwrap_or_else(|| UNKNOWN_HOST.to_string());
        let fetch = async {
            let _permit = self.hosts.acquire(&host).await;
            self.fetcher.fetch_events(url, None).await
        };
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ItemOutcome::Interrupted),
            fetched = fetch => fetched,
        };

        match fetched {
            Ok(events) => {
                let written = self.backup.write(&entry.planning_id, &events).await?;
                self.queue
                    .store()
                    .record_success(&entry.planning_id, chrono::Utc::now())
                    .await?;
                self.queue.complete(&entry.planning_id).await?;
                debug!(
                    planning_id = %entry.planning_id,
                    host = %host,
                    events = events.len(),
                    changed = written.changed,
                    "Planning refreshed"
                );
                Ok(ItemOutcome::Refreshed)
            }
            Err(failure) => {
                let disposition = self.queue.fail(entry, &self.worker_id, &failure).await?;
                Ok(ItemOutcome::Failed(disposition))
            }
        }
    }

    async fn log_stats(&self) {
        let totals = self.totals();
        info!(
            worker_id = %self.worker_id,
            picked = totals.picked,
            deleted = totals.deleted,
            requeued = totals.requeued,
            failed = totals.failed,
            released = totals.released,
            "Refresh worker stats"
        );

        let reclaimed = self.hosts.reclaim_idle();
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed idle host buckets");
        }

        match self.queue.snapshot(self.config.snapshot_top_n).await {
            Ok(snapshot) => info!(
                queue_depth = snapshot.queue_depth,
                ready = snapshot.ready,
                locked = snapshot.locked,
                terminal = snapshot.terminal,
                disabled = snapshot.disabled,
                stale_over_24h = snapshot.staleness.over_24h,
                never_refreshed = snapshot.staleness.never,
                "Refresh queue snapshot"
            ),
            Err(error) => warn!(error = %error, "Queue snapshot failed"),
        }
    }
}

/// Next idle wait after a drain that claimed `picked` rows
pub fn next_idle(current: Duration, picked: u64, min: Duration, max: Duration) -> Duration {
    if picked > 0 {
        min
    } else {
        current.saturating_mul(2).clamp(min, max)
    }
}

#[async_trait]
impl BackgroundJob for RefreshWorker {
    fn job_id(&self) -> &'static str {
        REFRESH_WORKER_JOB
    }

    async fn run(self: Arc<Self>, ctx: JobContext) {
        let (min_idle, max_idle) = (self.config.min_idle(), self.config.max_idle());
        let mut idle = min_idle;
        let mut last_stats = Instant::now();
        info!(worker_id = %self.worker_id, lanes = self.config.lanes, "Refresh worker started");

        loop {
            if !ctx.wait_while_paused().await {
                break;
            }

            let picked = match self.drain_until(ctx.cancellation_token()).await {
                Ok(report) => report.picked,
                Err(error) => {
                    error!(worker_id = %self.worker_id, error = %error, "Drain failed");
                    0
                }
            };

            if last_stats.elapsed() >= self.config.stats_log_interval() {
                self.log_stats().await;
                last_stats = Instant::now();
            }

            if picked > 0 {
                idle = min_idle;
                if ctx.is_cancelled() {
                    break;
                }
                continue;
            }

            match ctx.sleep_or_cancel(idle).await {
                Wake::Cancelled => break,
                Wake::Poked => idle = min_idle,
                Wake::Elapsed => idle = next_idle(idle, 0, min_idle, max_idle),
            }
        }

        info!(worker_id = %self.worker_id, "Refresh worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_doubles_and_resets() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let mut idle = min;
        let mut seen = Vec::new();
        for _ in 0..7 {
            idle = next_idle(idle, 0, min, max);
            seen.push(idle.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(next_idle(idle, 3, min, max), min);
    }
}
