//! # Per-Host Semaphore
//!
//! Bounds concurrent outbound fetches per upstream host. Each host gets its own
//! `tokio::sync::Semaphore` (FIFO-fair, so waiters are served in arrival order), created
//! lazily with full capacity. There is no global cap.
//!
//! Buckets are reclaimed eagerly: when a permit is released and the bucket has no holders
//! and no waiters, it is removed from the map. Because acquirers clone the bucket `Arc`
//! under the same map shard lock that reclamation uses, a bucket that anyone holds or waits
//! on always has a strong count above one and is never removed underneath them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct HostSemaphore {
    buckets: Arc<DashMap<String, Arc<Semaphore>>>,
    capacity: usize,
}

/// A held per-host permit; dropping it releases the permit
#[derive(Debug)]
pub struct HostPermit {
    permit: Option<OwnedSemaphorePermit>,
    key: String,
    buckets: Arc<DashMap<String, Arc<Semaphore>>>,
    capacity: usize,
}

impl HostSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Wait until a permit for `key` is free
    pub async fn acquire(&self, key: &str) -> HostPermit {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone();

        // The semaphore is never closed, so acquisition only fails if it were
        let permit = bucket.acquire_owned().await.ok();
        trace!(host = %key, "Host permit acquired");

        HostPermit {
            permit,
            key: key.to_string(),
            buckets: Arc::clone(&self.buckets),
            capacity: self.capacity,
        }
    }

    /// Release a permit explicitly; equivalent to dropping it
    pub fn release(&self, permit: HostPermit) {
        drop(permit);
    }

    /// Permits currently free for `key` (full capacity for unknown keys)
    pub fn available(&self, key: &str) -> usize {
        self.buckets
            .get(key)
            .map(|bucket| bucket.available_permits())
            .unwrap_or(self.capacity)
    }

    /// Number of host buckets currently tracked
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Remove every idle bucket
    pub fn reclaim_idle(&self) -> usize {
        let before = self.buckets.len();
        let capacity = self.capacity;
        self.buckets
            .retain(|_, bucket| !is_idle(bucket, capacity));
        before.saturating_sub(self.buckets.len())
    }
}

fn is_idle(bucket: &Arc<Semaphore>, capacity: usize) -> bool {
    Arc::strong_count(bucket) == 1 && bucket.available_permits() == capacity
}

impl HostPermit {
    pub fn host(&self) -> &str {
        &self.key
    }
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        // Return the permit first: this wakes the next FIFO waiter, if any
        drop(self.permit.take());
        let capacity = self.capacity;
        self.buckets
            .remove_if(&self.key, |_, bucket| is_idle(bucket, capacity));
    }
}
