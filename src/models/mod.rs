//! # Data Layer
//!
//! Row types for the refresh pipeline tables and the value types that flow between the
//! fetcher, the queue and the backup store.
//!
//! - [`planning`] - planning references, calendar events and date windows
//! - [`queue_entry`] - durable work queue rows and claim results
//! - [`refresh_state`] - per-planning failure history and disable windows
//! - [`backup_record`] - stored event snapshots
//! - [`ops_snapshot`] - read-only operational view for monitoring

pub mod backup_record;
pub mod ops_snapshot;
pub mod planning;
pub mod queue_entry;
pub mod refresh_state;

pub use backup_record::BackupRecord;
pub use ops_snapshot::{OpsSnapshot, PendingEntrySummary, StalenessBuckets};
pub use planning::{CalendarEvent, DateRange, PlanningId, PlanningRef};
pub use queue_entry::{ClaimedEntry, EnqueueOutcome, WorkQueueEntry};
pub use refresh_state::{FailureRecord, RefreshState};
