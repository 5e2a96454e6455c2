//! Error types for the planning refresh pipeline.
//!
//! Per-item failures inside the worker are never surfaced through these types: they are
//! converted into [`FetchFailure`](crate::fetch::FetchFailure) values and folded into the
//! queue. `RefreshError` covers infrastructure failures (database, configuration, transport
//! setup) that callers of the store and queue APIs must handle.

use crate::config::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefreshError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("HTTP client error: {0}")]
    HttpError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RefreshError {
    fn from(err: sqlx::Error) -> Self {
        RefreshError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for RefreshError {
    fn from(error: serde_json::Error) -> Self {
        RefreshError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<ConfigurationError> for RefreshError {
    fn from(error: ConfigurationError) -> Self {
        RefreshError::ConfigurationError(error.to_string())
    }
}

impl From<config::ConfigError> for RefreshError {
    fn from(error: config::ConfigError) -> Self {
        RefreshError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RefreshError>;
