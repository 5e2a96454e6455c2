//! # Orchestration
//!
//! Background loops and user-facing entry points of the refresh pipeline.
//!
//! ## Core Components
//!
//! - **JobsRuntime**: process-scoped lifecycle (start, stop, pause, resume, poke)
//! - **RefreshWorker**: drains the durable queue in concurrent lanes under a wall-clock budget
//! - **BackfillScanner**: re-enqueues stale plannings outside quiet hours and sweeps exhausted rows
//! - **RefreshRequester**: throttled user refreshes that poke the worker
//! - **RefreshSystem**: wires everything from configuration

pub mod backfill;
pub mod bootstrap;
pub mod jobs;
pub mod quiet_hours;
pub mod refresh_requests;
pub mod worker;

pub use backfill::{BackfillReport, BackfillScanner};
pub use bootstrap::RefreshSystem;
pub use jobs::{BackgroundJob, JobContext, JobsRuntime, Wake};
pub use quiet_hours::QuietHours;
pub use refresh_requests::{RefreshRequestOutcome, RefreshRequester};
pub use worker::{next_idle, DrainReport, RefreshWorker};
