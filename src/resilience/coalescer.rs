//! # In-Flight Request Coalescer
//!
//! Collapses concurrent calls for the same key into one pending operation. This is
//! coalescing, not caching: once the operation settles the key is free again and the next
//! call starts a fresh one.
//!
//! Only the caller that registered an operation may deregister it, and only if the entry
//! still carries its generation. Followers never touch the map, so a late follower of one
//! round cannot remove the entry of a round that has already started.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type InFlightMap<K, V> = Arc<Mutex<HashMap<K, InFlightEntry<V>>>>;

struct InFlightEntry<V> {
    generation: u64,
    future: Shared<BoxFuture<'static, V>>,
}

pub struct InFlightCoalescer<K, V> {
    inflight: InFlightMap<K, V>,
    next_generation: AtomicU64,
    max_keys: usize,
}

impl<K, V> InFlightCoalescer<K, V>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `max_keys` bounds the map; beyond it, new keys run uncoalesced
    pub fn new(max_keys: usize) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            max_keys: max_keys.max(1),
        }
    }

    /// Run `make()` for `key`, or join the operation already in flight for it
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let coalesced = {
            let mut inflight = self.inflight.lock();
            if let Some(entry) = inflight.get(&key) {
                debug!(key = ?key, generation = entry.generation, "Joining in-flight request");
                Ok((entry.future.clone(), None))
            } else if inflight.len() >= self.max_keys {
                drop(inflight);
                debug!(
                    key = ?key,
                    max_keys = self.max_keys,
                    "In-flight map full, running uncoalesced"
                );
                Err(make())
            } else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let future = make().boxed().shared();
                inflight.insert(
                    key.clone(),
                    InFlightEntry {
                        generation,
                        future: future.clone(),
                    },
                );
                let registration = Registration {
                    inflight: Arc::clone(&self.inflight),
                    key,
                    generation,
                };
                Ok((future, Some(registration)))
            }
        };
        let (future, _registration) = match coalesced {
            Ok(joined) => joined,
            Err(uncoalesced) => return uncoalesced.await,
        };

        // `_registration` deregisters when this scope ends, including on cancellation
        future.await
    }

    /// Number of keys with an operation in flight
    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Held by the creator of an in-flight entry; removes it on drop
struct Registration<K: Eq + Hash, V> {
    inflight: InFlightMap<K, V>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for Registration<K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if inflight
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_operation() {
        let coalescer = Arc::new(InFlightCoalescer::<String, usize>::new(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("planning.a".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst) + 41
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|value| *value == 41));
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_settled_key_starts_fresh_operation() {
        let coalescer = InFlightCoalescer::<&'static str, usize>::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let calls = Arc::clone(&calls);
            let value = coalescer
                .run("k", move || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(value, expected);
        }
    }

    #[tokio::test]
    async fn test_follower_does_not_remove_next_round() {
        let coalescer = Arc::new(InFlightCoalescer::<&'static str, u8>::new(100));
        let (release_first, first_gate) = tokio::sync::oneshot::channel::<()>();

        let creator = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("k", move || async move {
                        let _ = first_gate.await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.run("k", || async { 99 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _ = release_first.send(());
        assert_eq!(creator.await.unwrap(), 1);

        // Second round starts while the first-round follower may still be finishing
        let (release_second, second_gate) = tokio::sync::oneshot::channel::<()>();
        let second = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("k", move || async move {
                        let _ = second_gate.await;
                        2
                    })
                    .await
            })
        };
        assert_eq!(follower.await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coalescer.in_flight_count(), 1);

        let _ = release_second.send(());
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_full_map_runs_uncoalesced() {
        let coalescer = Arc::new(InFlightCoalescer::<u32, u32>::new(1));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let blocker = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run(1, move || async move {
                        let _ = gate.await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(coalescer.run(2, || async { 2 }).await, 2);
        assert_eq!(coalescer.in_flight_count(), 1);

        let _ = release.send(());
        assert_eq!(blocker.await.unwrap(), 1);
    }
}
