//! # Backup Store Writer
//!
//! Keeps one event snapshot per planning. Writes are idempotent under reordering: the stored
//! row changes only when the canonical signature of the events changes, and the writer
//! reports whether it did.
//!
//! Two write paths:
//!
//! - [`BackupWriter`] - awaited conditional upsert, used by the refresh worker
//! - [`ThrottledBackupWriter`] - fire-and-forget path for the read side, coalescing rapid
//!   writes per key with a minimum spacing and a capped key map

pub mod signature;
pub mod writer;

pub use signature::{compute_signature, normalize_events};
pub use writer::{BackupWriteOutcome, BackupWriter, ScheduleOutcome, ThrottledBackupWriter};
