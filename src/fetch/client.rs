//! Upstream HTTP access.
//!
//! [`FeedClient`] is the seam between the fetcher and the network. The production
//! implementation wraps `reqwest`; tests substitute scripted clients.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::{RefreshError, Result};

/// Response as seen by the classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Raw `Retry-After` header value
    pub retry_after: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
    /// The body was cut at the configured size limit
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    Other,
}

/// Failure to obtain any response from the upstream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Issue a GET and return whatever the upstream answered
    async fn get(&self, url: &str) -> std::result::Result<RawResponse, TransportError>;
}

/// `reqwest`-backed client with timeout, User-Agent and body size cap
#[derive(Debug, Clone)]
pub struct ReqwestFeedClient {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ReqwestFeedClient {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RefreshError::HttpError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl FeedClient for ReqwestFeedClient {
    async fn get(&self, url: &str) -> std::result::Result<RawResponse, TransportError> {
        let mut response = self.client.get(url).send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let retry_after = header(reqwest::header::RETRY_AFTER);
        let content_type = header(reqwest::header::CONTENT_TYPE);

        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if bytes.len() + chunk.len() > self.max_body_bytes {
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(
            url = %url,
            status = status,
            body_bytes = bytes.len(),
            truncated = truncated,
            "Upstream responded"
        );

        Ok(RawResponse {
            status,
            retry_after,
            content_type,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            truncated,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if is_connection_refused(&error) {
        TransportErrorKind::ConnectionRefused
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, error.to_string())
}

/// Walk the source chain looking for an `ECONNREFUSED`
fn is_connection_refused(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<io::Error>() {
            if io_error.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = err.source();
    }
    false
}
