mod common;

use chrono::{Duration, Utc};
use common::*;
use planning_refresh::config::{BackoffConfig, QueueConfig};
use planning_refresh::constants::priority;
use planning_refresh::database::{MemoryRefreshStore, RefreshStore};
use planning_refresh::fetch::{FailureKind, FetchFailure};
use planning_refresh::models::{EnqueueOutcome, WorkQueueEntry};
use planning_refresh::queue::{FailureDisposition, WorkQueue};
use planning_refresh::resilience::BackoffPolicy;
use std::sync::Arc;

const OWNER: &str = "worker-a";

/// Queue whose retries are due immediately
fn immediate_queue(store: Arc<MemoryRefreshStore>, max_attempts: i32) -> WorkQueue {
    WorkQueue::new(
        store,
        &QueueConfig {
            max_attempts,
            ..QueueConfig::default()
        },
        BackoffPolicy::new(&BackoffConfig {
            max_delay_ms: 0,
            jitter_enabled: false,
            ..BackoffConfig::default()
        }),
    )
}

fn not_found() -> FetchFailure {
    FetchFailure::new(FailureKind::Http4xx, "upstream answered 404").with_status(404)
}

fn timeout() -> FetchFailure {
    FetchFailure::new(FailureKind::Timeout, "operation timed out")
}

#[tokio::test]
async fn test_backfill_then_user_refresh_merges_into_one_row() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.1").await;
    let queue = immediate_queue(store.clone(), 10);

    assert_eq!(
        queue.enqueue_batch(&["planning.1".to_string()], priority::BACKFILL).await.unwrap(),
        1
    );
    assert_eq!(
        queue.enqueue("planning.1", priority::USER_REFRESH).await.unwrap(),
        EnqueueOutcome::Merged
    );

    assert_eq!(store.queue_len(), 1);
    let entry = store.get_entry("planning.1").await.unwrap().unwrap();
    assert_eq!(entry.priority, priority::USER_REFRESH);

    // A lower priority never lowers the row
    queue.enqueue("planning.1", priority::BACKFILL).await.unwrap();
    let entry = store.get_entry("planning.1").await.unwrap().unwrap();
    assert_eq!(entry.priority, priority::USER_REFRESH);
}

#[tokio::test]
async fn test_merge_keeps_lease_and_attempts() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.1").await;
    let queue = immediate_queue(store.clone(), 10);

    queue.enqueue("planning.1", priority::BACKFILL).await.unwrap();
    let claimed = queue.claim(OWNER, 5).await.unwrap();
    assert_eq!(claimed.len(), 1);

    queue.enqueue("planning.1", priority::USER_REFRESH).await.unwrap();
    let entry = store.get_entry("planning.1").await.unwrap().unwrap();
    assert_eq!(entry.lock_owner.as_deref(), Some(OWNER));
    assert_eq!(entry.attempts, 1);

    // Still leased, so not claimable by anyone else
    assert!(queue.claim("worker-b", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() {
    let store = Arc::new(MemoryRefreshStore::new());
    for id in ["old-backfill", "user", "new-backfill"] {
        register(&store, id).await;
    }
    let queue = immediate_queue(store.clone(), 10);
    queue.enqueue("old-backfill", priority::BACKFILL).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    queue.enqueue("new-backfill", priority::BACKFILL).await.unwrap();
    queue.enqueue("user", priority::USER_REFRESH).await.unwrap();

    let claimed = queue.claim(OWNER, 10).await.unwrap();
    let order: Vec<_> = claimed.iter().map(|c| c.planning_id.as_str()).collect();
    assert_eq!(order, vec!["user", "old-backfill", "new-backfill"]);
    assert!(claimed.iter().all(|c| c.attempts == 1));
    assert_eq!(claimed[0].url.as_deref(), Some(feed_url("user").as_str()));
}

#[tokio::test]
async fn test_not_found_is_permanent_and_disables_for_thirty_days() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.404").await;
    let queue = immediate_queue(store.clone(), 10);

    queue.enqueue("planning.404", priority::USER_REFRESH).await.unwrap();
    let claimed = queue.claim(OWNER, 1).await.unwrap();
    let disposition = queue.fail(&claimed[0], OWNER, &not_found()).await.unwrap();

    let FailureDisposition::Permanent { disabled_until } = disposition else {
        panic!("expected a permanent disposition, got {disposition:?}");
    };
    let window = disabled_until - Utc::now();
    assert!(window > Duration::days(29) && window <= Duration::days(30));

    // Deleted on the first attempt
    assert!(store.get_entry("planning.404").await.unwrap().is_none());
    let state = store.get_refresh_state("planning.404").await.unwrap().unwrap();
    assert!(state.last_error.unwrap().starts_with("permanent:"));
    assert_eq!(state.last_failure_kind.as_deref(), Some("http_4xx"));

    // Disabled plannings are neither backfilled nor claimed
    let now = Utc::now();
    let candidates = store
        .backfill_candidates(now, now, 100)
        .await
        .unwrap();
    assert!(!candidates.contains(&"planning.404".to_string()));
    queue.enqueue_batch(&["planning.404".to_string()], priority::BACKFILL).await.unwrap();
    assert!(queue.claim(OWNER, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_give_up_at_attempt_limit() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.slow").await;
    let queue = immediate_queue(store.clone(), 3);
    queue.enqueue("planning.slow", priority::USER_REFRESH).await.unwrap();

    let mut dispositions = Vec::new();
    for _ in 0..5 {
        let claimed = queue.claim(OWNER, 1).await.unwrap();
        let Some(entry) = claimed.first() else {
            break;
        };
        assert!(entry.attempts <= 3);
        dispositions.push(queue.fail(entry, OWNER, &timeout()).await.unwrap());
    }

    assert_eq!(dispositions.len(), 3);
    assert!(matches!(dispositions[0], FailureDisposition::Requeued { .. }));
    assert!(matches!(dispositions[1], FailureDisposition::Requeued { .. }));
    let FailureDisposition::GaveUp { disabled_until } = dispositions[2] else {
        panic!("expected a give-up, got {:?}", dispositions[2]);
    };
    let window = disabled_until - Utc::now();
    assert!(window > Duration::hours(5) && window <= Duration::hours(6));

    assert!(store.get_entry("planning.slow").await.unwrap().is_none());
    let state = store.get_refresh_state("planning.slow").await.unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 3);
    assert!(state.last_error.unwrap().starts_with("max_attempts:"));
}

#[tokio::test]
async fn test_requeue_by_stale_owner_reports_lease_lost() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.1").await;
    let queue = immediate_queue(store.clone(), 10);
    queue.enqueue("planning.1", priority::USER_REFRESH).await.unwrap();
    let claimed = queue.claim(OWNER, 1).await.unwrap();

    let disposition = queue.fail(&claimed[0], "someone-else", &timeout()).await.unwrap();
    assert_eq!(disposition, FailureDisposition::LeaseLost);
    let entry = store.get_entry("planning.1").await.unwrap().unwrap();
    assert_eq!(entry.lock_owner.as_deref(), Some(OWNER));
}

#[tokio::test]
async fn test_batch_enqueue_never_touches_settled_rows() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.dead").await;
    let queue = immediate_queue(store.clone(), 10);

    let long_ago = Utc::now() - Duration::hours(2);
    let mut settled = WorkQueueEntry::new("planning.dead", priority::BACKFILL, long_ago, long_ago);
    settled.attempts = 4;
    settled.last_error = Some("permanent: http_4xx: [410] upstream answered 410".to_string());
    store.insert_raw_entry(settled.clone());

    assert_eq!(
        queue.enqueue_batch(&["planning.dead".to_string()], priority::BACKFILL).await.unwrap(),
        0
    );
    assert_eq!(store.get_entry("planning.dead").await.unwrap().unwrap(), settled);
    assert!(queue.claim(OWNER, 5).await.unwrap().is_empty());

    // An explicit refresh revives it
    assert_eq!(
        queue.enqueue("planning.dead", priority::USER_REFRESH).await.unwrap(),
        EnqueueOutcome::Revived
    );
    let revived = store.get_entry("planning.dead").await.unwrap().unwrap();
    assert_eq!(revived.attempts, 0);
    assert_eq!(revived.last_error, None);
    assert_eq!(queue.claim(OWNER, 5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_recently_settled_row_skips_equal_priority_refresh() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.1").await;
    let queue = immediate_queue(store.clone(), 10);

    let now = Utc::now();
    let mut settled = WorkQueueEntry::new("planning.1", priority::USER_REFRESH, now, now);
    settled.last_error = Some("max_attempts: timeout: operation timed out".to_string());
    store.insert_raw_entry(settled);

    assert_eq!(
        queue.enqueue("planning.1", priority::USER_REFRESH).await.unwrap(),
        EnqueueOutcome::Skipped
    );
    assert_eq!(
        queue.enqueue("planning.1", priority::MAX).await.unwrap(),
        EnqueueOutcome::Revived
    );
}

#[tokio::test]
async fn test_sweep_moves_exhausted_rows_into_refresh_state() {
    let store = Arc::new(MemoryRefreshStore::new());
    register(&store, "planning.5xx").await;
    register(&store, "planning.refused").await;
    register(&store, "planning.fresh").await;
    let queue = immediate_queue(store.clone(), 3);

    let now = Utc::now();
    let mut exhausted = WorkQueueEntry::new("planning.5xx", priority::BACKFILL, now, now);
    exhausted.attempts = 3;
    exhausted.last_error = Some("http_5xx: [503] upstream answered 503".to_string());
    store.insert_raw_entry(exhausted);

    let mut refused = WorkQueueEntry::new("planning.refused", priority::BACKFILL, now, now);
    refused.attempts = 5;
    refused.last_error = Some("connection_refused: connection refused".to_string());
    store.insert_raw_entry(refused);

    queue.enqueue("planning.fresh", priority::BACKFILL).await.unwrap();

    assert_eq!(queue.sweep().await.unwrap(), 2);
    assert_eq!(store.queue_len(), 1);

    let state = store.get_refresh_state("planning.5xx").await.unwrap().unwrap();
    let window = state.disabled_until.unwrap() - Utc::now();
    assert!(window > Duration::hours(5) && window <= Duration::hours(6));
    assert_eq!(state.last_failure_kind.as_deref(), Some("http_5xx"));

    let state = store.get_refresh_state("planning.refused").await.unwrap().unwrap();
    let window = state.disabled_until.unwrap() - Utc::now();
    assert!(window > Duration::hours(11) && window <= Duration::hours(12));

    assert_eq!(queue.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_snapshot_counts_queue_states() {
    let store = Arc::new(MemoryRefreshStore::new());
    for id in ["a", "b", "c"] {
        register(&store, id).await;
    }
    let queue = immediate_queue(store.clone(), 10);
    queue.enqueue("a", priority::USER_REFRESH).await.unwrap();
    queue.enqueue("b", priority::BACKFILL).await.unwrap();
    queue.claim(OWNER, 1).await.unwrap();

    let snapshot = queue.snapshot(5).await.unwrap();
    assert_eq!(snapshot.queue_depth, 2);
    assert_eq!(snapshot.locked, 1);
    assert_eq!(snapshot.ready, 1);
    assert_eq!(snapshot.staleness.never, 3);
    assert_eq!(snapshot.top_pending.len(), 1);
    assert_eq!(snapshot.top_pending[0].planning_id, "b");
}
