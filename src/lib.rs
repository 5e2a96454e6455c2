#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Planning Refresh
//!
//! Keeps local snapshots of remote calendar feeds ("plannings") fresh while the upstream
//! servers are slow, flaky or rate-limited.
//!
//! ## Overview
//!
//! Reads are served from the network when possible and from the last stored backup
//! otherwise. Refreshes run in the background: a durable PostgreSQL work queue is drained
//! by a worker with per-host concurrency limits, classified failures feed an exponential
//! backoff, and repeatedly failing plannings are disabled for a window that depends on how
//! they failed.
//!
//! ## Module Organization
//!
//! - [`fetch`] - HTTP access, failure classification, parsing and read-through resolution
//! - [`resilience`] - backoff policy, per-host semaphore, in-flight coalescer, keyed throttle
//! - [`queue`] - durable work queue semantics on top of a [`database::RefreshStore`]
//! - [`backup`] - event signatures and the direct and throttled backup writers
//! - [`orchestration`] - jobs runtime, refresh worker, backfill scanner, user refreshes
//! - [`database`] - PostgreSQL and in-memory stores, migrations, connection pool
//! - [`models`] - row and value types
//! - [`config`] - configuration loading and validation
//! - [`error`] - structured error handling
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use planning_refresh::config::ConfigManager;
//! use planning_refresh::database::{DatabaseConnection, PgRefreshStore};
//! use planning_refresh::fetch::ReqwestFeedClient;
//! use planning_refresh::orchestration::RefreshSystem;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! let connection = DatabaseConnection::connect(&config.database).await?;
//! let store = Arc::new(PgRefreshStore::new(connection.pool().clone()));
//! let client = Arc::new(ReqwestFeedClient::new(&config.fetch)?);
//!
//! let system = RefreshSystem::build(config, store, client)?;
//! system.start();
//! system.requester().request_planning_refresh("planning.42").await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod resilience;

pub use config::{ConfigManager, RefreshConfig};
pub use constants::{error_markers, priority, system};
pub use error::{RefreshError, Result};
pub use fetch::{EventSource, FailureKind, FailureReason, FetchFailure, ResolvedEvents};
pub use models::{CalendarEvent, DateRange, OpsSnapshot, PlanningId, PlanningRef};
pub use orchestration::{RefreshRequestOutcome, RefreshSystem};
pub use queue::{FailureDisposition, WorkQueue};
