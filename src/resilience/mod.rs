//! # Resilience Module
//!
//! Backpressure and retry primitives shared by the read path and the refresh worker.
//!
//! ## Architecture
//!
//! - **Per-Host Semaphore**: FIFO-fair concurrency limit per upstream host
//! - **In-Flight Coalescer**: one pending operation per key for concurrent readers
//! - **Backoff Policy**: per-kind exponential retry delays and disable windows
//! - **Keyed Throttle**: once-per-window admission with a bounded key map
//!
//! ## Usage
//!
//! ```rust,no_run
//! use planning_refresh::resilience::HostSemaphore;
//!
//! # async fn example() {
//! let semaphore = HostSemaphore::new(2);
//! let permit = semaphore.acquire("ade.example.edu").await;
//! // fetch from ade.example.edu here
//! drop(permit);
//! # }
//! ```

pub mod backoff;
pub mod coalescer;
pub mod host_semaphore;
pub mod throttle;

pub use backoff::{base_delay, disable_window, BackoffPolicy};
pub use coalescer::InFlightCoalescer;
pub use host_semaphore::{HostPermit, HostSemaphore};
pub use throttle::KeyedThrottle;
