//! User-triggered refreshes.
//!
//! A request is throttled per planning, clears any disable window, enqueues the planning at
//! user priority and pokes the worker so it does not wait out its idle sleep.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use super::jobs::JobsRuntime;
use crate::config::RefreshRequestConfig;
use crate::constants::{priority, system::REFRESH_WORKER_JOB};
use crate::error::{RefreshError, Result};
use crate::models::EnqueueOutcome;
use crate::queue::WorkQueue;
use crate::resilience::KeyedThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "enqueue")]
pub enum RefreshRequestOutcome {
    /// The planning was already refreshed by a user inside the throttle window
    Throttled,
    Enqueued(EnqueueOutcome),
}

pub struct RefreshRequester {
    queue: Arc<WorkQueue>,
    jobs: Arc<JobsRuntime>,
    throttle: KeyedThrottle,
}

impl RefreshRequester {
    pub fn new(
        queue: Arc<WorkQueue>,
        jobs: Arc<JobsRuntime>,
        config: &RefreshRequestConfig,
    ) -> Self {
        Self {
            queue,
            jobs,
            throttle: KeyedThrottle::new(config.throttle_window(), config.max_tracked_keys),
        }
    }

    /// Plannings currently tracked by the throttle
    pub fn tracked_keys(&self) -> usize {
        self.throttle.tracked_keys()
    }

    #[instrument(skip(self))]
    pub async fn request_planning_refresh(
        &self,
        planning_id: &str,
    ) -> Result<RefreshRequestOutcome> {
        if !self.throttle.try_acquire(planning_id, Instant::now()) {
            debug!(planning_id, "Refresh request throttled");
            return Ok(RefreshRequestOutcome::Throttled);
        }

        let store = self.queue.store();
        if store.get_planning(planning_id).await?.is_none() {
            return Err(RefreshError::ValidationError(format!(
                "unknown planning: {planning_id}"
            )));
        }

        store.clear_disable(planning_id).await?;
        let outcome = self
            .queue
            .enqueue(planning_id, priority::USER_REFRESH)
            .await?;
        let poked = self.jobs.poke(REFRESH_WORKER_JOB);
        info!(planning_id, outcome = ?outcome, poked, "Refresh requested");
        Ok(RefreshRequestOutcome::Enqueued(outcome))
    }

    #[doc(hidden)]
    pub fn clear_throttle(&self) {
        self.throttle.clear();
    }
}
