mod common;

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use common::strategies::*;
use common::register;
use planning_refresh::backup::compute_signature;
use planning_refresh::config::{BackoffConfig, QueueConfig};
use planning_refresh::constants::priority;
use planning_refresh::database::MemoryRefreshStore;
use planning_refresh::fetch::{FailureKind, FetchFailure};
use planning_refresh::models::WorkQueueEntry;
use planning_refresh::orchestration::QuietHours;
use planning_refresh::queue::merge::{plan_batch, plan_single, MergePlan};
use planning_refresh::queue::WorkQueue;
use planning_refresh::resilience::BackoffPolicy;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn merged_priority(plan: MergePlan) -> Option<i32> {
    match plan {
        MergePlan::Insert { priority, .. }
        | MergePlan::Merge { priority, .. }
        | MergePlan::Revive { priority, .. } => Some(priority),
        MergePlan::Skip => None,
    }
}

proptest! {
    /// Property: event order and surrounding whitespace never change the signature
    #[test]
    fn signature_ignores_event_order((events, shuffled) in shuffled_events_strategy()) {
        prop_assert_eq!(
            compute_signature(&events).unwrap(),
            compute_signature(&shuffled).unwrap()
        );
    }

    /// Property: events tied on every sort key still sign the same in any order
    #[test]
    fn signature_ignores_order_of_tied_events(
        (events, shuffled) in prop::collection::vec(colliding_event_strategy(), 0..12)
            .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle()))
    ) {
        prop_assert_eq!(
            compute_signature(&events).unwrap(),
            compute_signature(&shuffled).unwrap()
        );
    }

    /// Property: jittered delays stay within the ratio around the capped exponential delay
    #[test]
    fn backoff_delay_is_bounded(
        attempt in 1i32..40,
        kind in failure_kind_strategy(),
        jitter_ratio in 0.0f64..0.5,
    ) {
        let policy = BackoffPolicy::new(&BackoffConfig {
            jitter_ratio,
            ..BackoffConfig::default()
        });
        let computed = policy.computed_delay(attempt, kind);
        let delay = policy.delay_for(attempt, &FetchFailure::new(kind, "failure"));

        prop_assert!(computed <= Duration::from_secs(600));
        prop_assert!(delay.as_secs_f64() >= computed.as_secs_f64() * (1.0 - jitter_ratio) - 0.001);
        prop_assert!(delay.as_secs_f64() <= computed.as_secs_f64() * (1.0 + jitter_ratio) + 0.001);
    }

    /// Property: a 429 never retries sooner than the server asked
    #[test]
    fn rate_limit_honours_retry_after(attempt in 1i32..12, retry_after_ms in 0u64..3_600_000) {
        let policy = BackoffPolicy::new(&BackoffConfig::default());
        let mut failure = FetchFailure::new(FailureKind::Http429, "rate limited");
        failure.retry_after_ms = Some(retry_after_ms);
        prop_assert!(policy.delay_for(attempt, &failure) >= Duration::from_millis(retry_after_ms));
    }

    /// Property: merges never lower a priority and never exceed the maximum
    #[test]
    fn merge_never_lowers_priority(
        existing_priority in 0i32..=100,
        requested in 0i32..200,
        terminal in any::<bool>(),
        settled_seconds_ago in 0i64..120,
    ) {
        let now = Utc::now();
        let mut entry = WorkQueueEntry::new(
            "p",
            existing_priority,
            now,
            now - ChronoDuration::seconds(settled_seconds_ago),
        );
        if terminal {
            entry.last_error = Some("max_attempts: timeout: slow".to_string());
        }

        for plan in [
            plan_single(Some(&entry), requested, now, now),
            plan_batch(Some(&entry), requested, now),
        ] {
            if let Some(priority) = merged_priority(plan) {
                prop_assert!(priority >= existing_priority);
                prop_assert!(priority <= priority::MAX);
            }
        }
        if terminal {
            prop_assert_eq!(plan_batch(Some(&entry), requested, now), MergePlan::Skip);
        }
    }

    /// Property: a window crossing midnight is the complement of the inverted window
    #[test]
    fn quiet_hours_crossing_midnight_complements(
        start_minute in 0u32..1440,
        end_minute in 0u32..1440,
        sample_minute in 0u32..1440,
    ) {
        prop_assume!(start_minute != end_minute);
        let time = |minute: u32| NaiveTime::from_hms_opt(minute / 60, minute % 60, 0).unwrap();
        let window = QuietHours::new(time(start_minute), time(end_minute), chrono_tz::UTC);
        let inverse = QuietHours::new(time(end_minute), time(start_minute), chrono_tz::UTC);
        let sample = time(sample_minute);
        prop_assert_ne!(window.contains_local(sample), inverse.contains_local(sample));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: concurrent claimants never receive the same row
    #[test]
    fn concurrent_claims_are_disjoint(
        rows in 1usize..60,
        claimants in 2usize..8,
        limit in 1i64..10,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let claimed: Vec<String> = runtime.block_on(async move {
            let store = Arc::new(MemoryRefreshStore::new());
            let queue = Arc::new(WorkQueue::new(
                store.clone(),
                &QueueConfig::default(),
                BackoffPolicy::new(&BackoffConfig::default()),
            ));
            for index in 0..rows {
                let id = format!("planning.{index}");
                register(&store, &id).await;
                queue.enqueue(&id, priority::BACKFILL).await.unwrap();
            }

            let handles: Vec<_> = (0..claimants)
                .map(|claimant| {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        let owner = format!("worker-{claimant}");
                        let mut mine = Vec::new();
                        loop {
                            let batch = queue.claim(&owner, limit).await.unwrap();
                            if batch.is_empty() {
                                return mine;
                            }
                            mine.extend(batch.into_iter().map(|entry| entry.planning_id));
                        }
                    })
                })
                .collect();

            let mut all = Vec::new();
            for handle in handles {
                all.extend(handle.await.unwrap());
            }
            all
        });

        let unique: HashSet<&String> = claimed.iter().collect();
        prop_assert_eq!(unique.len(), claimed.len());
        prop_assert_eq!(claimed.len(), rows);
    }
}
