//! Upstream fetcher: URL templating, request, classification and parsing in one call.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::client::FeedClient;
use super::failure::{classify, FailureKind, FetchFailure, RawFetchOutcome};
use super::parser::CalendarParser;
use super::template::render_url;
use crate::models::{CalendarEvent, DateRange};

/// Either the parsed events or the classified failure, never both
pub type FetchResult = std::result::Result<Arc<Vec<CalendarEvent>>, FetchFailure>;

pub struct UpstreamFetcher {
    client: Arc<dyn FeedClient>,
    parser: Arc<dyn CalendarParser>,
}

impl UpstreamFetcher {
    pub fn new(client: Arc<dyn FeedClient>, parser: Arc<dyn CalendarParser>) -> Self {
        Self { client, parser }
    }

    /// Fetch and parse a feed
    ///
    /// Placeholders in `url` are rendered with `range`, or with the default window when no
    /// range is given. Never returns an infrastructure error: every problem is classified.
    #[instrument(skip(self), fields(host = ?upstream_host(url)))]
    pub async fn fetch_events(&self, url: &str, range: Option<DateRange>) -> FetchResult {
        let now = Utc::now();
        let target = render_url(url, range, now.date_naive());

        let response = match self.client.get(&target).await {
            Ok(response) => response,
            Err(error) => {
                let failure = classify(RawFetchOutcome::Transport(&error), now)
                    .unwrap_or_else(|| FetchFailure::new(FailureKind::NetworkError, error.message));
                warn!(kind = %failure.kind, error = %failure.message, "Upstream unreachable");
                return Err(failure);
            }
        };

        if let Some(failure) = classify(RawFetchOutcome::Response(&response), now) {
            warn!(
                kind = %failure.kind,
                status = response.status,
                retry_after_ms = failure.retry_after_ms,
                "Upstream fetch failed"
            );
            return Err(failure);
        }

        match self.parser.parse(&response.body) {
            Ok(events) => {
                debug!(events = events.len(), "Upstream feed parsed");
                Ok(Arc::new(events))
            }
            Err(error) => {
                warn!(error = %error, "Upstream feed could not be parsed");
                Err(FetchFailure::parse_error(error.to_string()).with_status(response.status))
            }
        }
    }
}

/// Lower-cased host of a feed URL, used as the per-host concurrency key
pub fn upstream_host(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
}
