//! # Database Operations
//!
//! Persistence for the refresh pipeline.
//!
//! ## Key Components
//!
//! - [`store`] - the [`RefreshStore`] seam every component talks to
//! - [`postgres`] - production store on PostgreSQL with `SKIP LOCKED` claiming
//! - [`memory`] - mutex-guarded store with identical semantics
//! - [`migrations`] - embedded schema applied under an advisory lock
//! - [`connection`] - pool setup and health check
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use planning_refresh::config::DatabaseConfig;
//! use planning_refresh::database::{DatabaseConnection, DatabaseMigrations, PgRefreshStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! DatabaseMigrations::run_all(db.pool()).await?;
//! let store = PgRefreshStore::new(db.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;

pub use connection::DatabaseConnection;
pub use memory::MemoryRefreshStore;
pub use migrations::DatabaseMigrations;
pub use postgres::PgRefreshStore;
pub use store::{ClaimRequest, RefreshStore, SnapshotRequest};
