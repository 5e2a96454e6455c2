//! # Upstream Fetching
//!
//! Everything between a feed URL and a list of events: HTTP access, failure
//! classification, date-range templating, parsing, and the read-through resolver that
//! falls back to the backup store.

pub mod client;
pub mod failure;
pub mod fetcher;
pub mod parser;
pub mod resolver;
pub mod template;

pub use client::{FeedClient, RawResponse, ReqwestFeedClient, TransportError, TransportErrorKind};
pub use failure::{
    classify, parse_retry_after, FailureClass, FailureKind, FetchFailure, RawFetchOutcome,
};
pub use fetcher::{upstream_host, FetchResult, UpstreamFetcher};
pub use parser::{CalendarParser, IcsParser};
pub use resolver::{failure_reason, EventSource, EventsResolver, FailureReason, ResolvedEvents};
