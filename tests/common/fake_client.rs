use async_trait::async_trait;
use parking_lot::Mutex;
use planning_refresh::fetch::{FeedClient, RawResponse, TransportError, TransportErrorKind};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted upstream answer
#[derive(Debug, Clone)]
pub enum Scripted {
    Response(RawResponse),
    Transport(TransportError),
}

impl Scripted {
    pub fn calendar(body: impl Into<String>) -> Self {
        Scripted::Response(RawResponse {
            status: 200,
            retry_after: None,
            content_type: Some("text/calendar".to_string()),
            body: body.into(),
            truncated: false,
        })
    }

    pub fn status(status: u16) -> Self {
        Scripted::Response(RawResponse {
            status,
            retry_after: None,
            content_type: Some("text/plain".to_string()),
            body: format!("status {status}"),
            truncated: false,
        })
    }

    pub fn rate_limited(retry_after: &str) -> Self {
        Scripted::Response(RawResponse {
            status: 429,
            retry_after: Some(retry_after.to_string()),
            content_type: None,
            body: String::new(),
            truncated: false,
        })
    }

    pub fn html() -> Self {
        Scripted::Response(RawResponse {
            status: 200,
            retry_after: None,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: "<!DOCTYPE html><html><body>Maintenance</body></html>".to_string(),
            truncated: false,
        })
    }

    pub fn timeout() -> Self {
        Scripted::Transport(TransportError::new(
            TransportErrorKind::Timeout,
            "operation timed out",
        ))
    }

    pub fn refused() -> Self {
        Scripted::Transport(TransportError::new(
            TransportErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }
}

#[derive(Default)]
struct Script {
    /// Answers consumed in order before falling back to `fallback`
    queued: VecDeque<Scripted>,
    fallback: Option<Scripted>,
}

/// Scripted [`FeedClient`] that counts calls per URL
#[derive(Default)]
pub struct FakeFeedClient {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    delay: Mutex<Duration>,
}

impl FakeFeedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request to `url` with `answer` unless a queued answer is pending
    pub fn always(&self, url: &str, answer: Scripted) {
        self.scripts.lock().entry(url.to_string()).or_default().fallback = Some(answer);
    }

    /// Answer the next request to `url` with `answer`
    pub fn then(&self, url: &str, answer: Scripted) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .queued
            .push_back(answer);
    }

    /// Delay every answer
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Highest number of requests observed in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedClient for FakeFeedClient {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().entry(url.to_string()).or_default() += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let answer = {
            let mut scripts = self.scripts.lock();
            scripts.get_mut(url).and_then(|script| {
                script
                    .queued
                    .pop_front()
                    .or_else(|| script.fallback.clone())
            })
        };
        match answer {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Transport(error)) => Err(error),
            None => Err(TransportError::new(
                TransportErrorKind::Other,
                format!("no scripted answer for {url}"),
            )),
        }
    }
}
