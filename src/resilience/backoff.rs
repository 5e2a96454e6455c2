//! # Backoff & Disable Policy
//!
//! Retry delays and disable windows as data tables keyed by [`FailureKind`].
//!
//! Delay for attempt `n` (1-based): `base(kind) * 2^(n-1)`, capped at `max_delay`, then
//! jittered by ±`jitter_ratio`. For `http_429` the jittered delay is finally floored to the
//! server's `Retry-After`, so the wait is never shorter than what the upstream asked for.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::fetch::{FailureKind, FetchFailure};

/// Base delay of the first retry for a failure kind
pub fn base_delay(kind: FailureKind) -> Duration {
    match kind {
        FailureKind::ConnectionRefused => Duration::from_secs(30),
        FailureKind::Timeout => Duration::from_secs(10),
        FailureKind::ParseError | FailureKind::InvalidBody => Duration::from_secs(60),
        FailureKind::NetworkError
        | FailureKind::Http429
        | FailureKind::Http4xx
        | FailureKind::Http5xx => Duration::from_secs(5),
    }
}

/// How long a planning stays disabled after a give-up or a permanent failure
///
/// `kind` is `None` for a give-up with no classified cause.
pub fn disable_window(kind: Option<FailureKind>, status: Option<u16>) -> ChronoDuration {
    match (kind, status) {
        (Some(FailureKind::Http4xx), Some(404)) => ChronoDuration::days(30),
        (Some(FailureKind::Http4xx), _) => ChronoDuration::days(7),
        (Some(FailureKind::ParseError | FailureKind::InvalidBody), _) => ChronoDuration::hours(24),
        (Some(FailureKind::ConnectionRefused), _) => ChronoDuration::hours(12),
        _ => ChronoDuration::hours(6),
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_delay: Duration,
    jitter_ratio: f64,
    jitter_enabled: bool,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            max_delay: config.max_delay(),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 0.99),
            jitter_enabled: config.jitter_enabled,
        }
    }

    /// Exponential delay before jitter and before any `Retry-After` floor
    pub fn computed_delay(&self, attempt: i32, kind: FailureKind) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        let base_ms = base_delay(kind).as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Delay before the next attempt of a failed item
    pub fn delay_for(&self, attempt: i32, failure: &FetchFailure) -> Duration {
        let jittered = self.apply_jitter(self.computed_delay(attempt, failure.kind));
        match (failure.kind, failure.retry_after_ms) {
            (FailureKind::Http429, Some(retry_after_ms)) => {
                jittered.max(Duration::from_millis(retry_after_ms))
            }
            _ => jittered,
        }
    }

    /// Absolute time of the next attempt
    pub fn next_attempt_at(
        &self,
        attempt: i32,
        failure: &FetchFailure,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = self.delay_for(attempt, failure);
        now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::minutes(10))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter_enabled || self.jitter_ratio == 0.0 {
            return delay;
        }
        let factor =
            rand::thread_rng().gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        delay.mul_f64(factor)
    }
}
