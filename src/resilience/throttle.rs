//! Per-key throttle with a hard cap on tracked keys.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Allows each key at most once per window
///
/// Once `max_keys` keys are tracked, expired entries are pruned first and then the
/// least-recently-touched key is evicted, so the map never grows past the cap.
///
/// A plain map rather than a `moka` cache: moka bounds its size only approximately and
/// evicts asynchronously, while callers here rely on the cap being exact.
#[derive(Debug)]
pub struct KeyedThrottle {
    window: Duration,
    max_keys: usize,
    last_allowed: Mutex<HashMap<String, Instant>>,
}

impl KeyedThrottle {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            window,
            max_keys: max_keys.max(1),
            last_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key`; `true` when it is allowed
    pub fn try_acquire(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.last_allowed.lock();

        if let Some(last) = entries.get(key) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
            entries.insert(key.to_string(), now);
            return true;
        }

        if entries.len() >= self.max_keys {
            let window = self.window;
            entries.retain(|_, last| now.saturating_duration_since(*last) < window);
        }
        if entries.len() >= self.max_keys {
            let oldest = entries
                .iter()
                .min_by_key(|(_, last)| **last)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(key.to_string(), now);
        true
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_allowed.lock().len()
    }

    /// Drop all state
    #[doc(hidden)]
    pub fn clear(&self) {
        self.last_allowed.lock().clear();
    }
}
