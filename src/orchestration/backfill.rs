//! # Backfill Scanner
//!
//! Periodically enqueues plannings whose backup is missing or older than the staleness
//! threshold, at backfill priority, and moves exhausted queue rows into the failure history.
//! Inside quiet hours the scanner does nothing and sleeps in `quiet_sleep` slices.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::jobs::{BackgroundJob, JobContext, Wake};
use super::quiet_hours::QuietHours;
use crate::config::BackfillConfig;
use crate::constants::{priority, system::BACKFILL_JOB};
use crate::error::{RefreshError, Result};
use crate::queue::WorkQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Stale plannings found
    pub candidates: usize,
    /// Rows inserted or merged by the batch enqueue
    pub enqueued: u64,
    /// Exhausted rows moved out of the queue
    pub swept: usize,
}

pub struct BackfillScanner {
    queue: Arc<WorkQueue>,
    config: BackfillConfig,
    quiet_hours: Option<QuietHours>,
}

impl BackfillScanner {
    pub fn new(
        queue: Arc<WorkQueue>,
        config: BackfillConfig,
        quiet_hours: Option<QuietHours>,
    ) -> Self {
        Self {
            queue,
            config,
            quiet_hours,
        }
    }

    /// Build from configuration, parsing the quiet hours if any
    pub fn from_config(queue: Arc<WorkQueue>, config: &BackfillConfig) -> Result<Self> {
        let quiet_hours = config
            .quiet_hours
            .as_ref()
            .map(QuietHours::from_config)
            .transpose()?;
        Ok(Self::new(queue, config.clone(), quiet_hours))
    }

    pub fn in_quiet_hours(&self, now: chrono::DateTime<Utc>) -> bool {
        self.quiet_hours.is_some_and(|quiet| quiet.contains(now))
    }

    /// One scan: enqueue stale plannings, then sweep exhausted rows
    pub async fn scan_once(&self) -> Result<BackfillReport> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.config.staleness()).map_err(|e| {
            RefreshError::ConfigurationError(format!("backfill.staleness_seconds: {e}"))
        })?;

        let candidates = self
            .queue
            .store()
            .backfill_candidates(now - staleness, now, self.config.scan_limit)
            .await?;
        let enqueued = if candidates.is_empty() {
            0
        } else {
            self.queue
                .enqueue_batch(&candidates, priority::BACKFILL)
                .await?
        };
        let swept = self.queue.sweep().await?;

        let report = BackfillReport {
            candidates: candidates.len(),
            enqueued,
            swept,
        };
        info!(
            candidates = report.candidates,
            enqueued = report.enqueued,
            swept = report.swept,
            "Backfill scan finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl BackgroundJob for BackfillScanner {
    fn job_id(&self) -> &'static str {
        BACKFILL_JOB
    }

    async fn run(self: Arc<Self>, ctx: JobContext) {
        info!(
            interval_seconds = self.config.interval_seconds,
            quiet_hours = self.quiet_hours.is_some(),
            "Backfill scanner started"
        );

        loop {
            if !ctx.wait_while_paused().await {
                break;
            }

            let sleep = if self.in_quiet_hours(Utc::now()) {
                debug!("Inside quiet hours, skipping backfill scan");
                self.config.quiet_sleep()
            } else {
                if let Err(error) = self.scan_once().await {
                    error!(error = %error, "Backfill scan failed");
                }
                self.config.interval()
            };

            if ctx.sleep_or_cancel(sleep).await == Wake::Cancelled {
                break;
            }
        }

        info!("Backfill scanner stopped");
    }
}
