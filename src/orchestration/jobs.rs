//! # Jobs Runtime
//!
//! Process-scoped lifecycle for the background loops. One [`JobsRuntime`] is created at
//! startup and injected wherever jobs are started, paused or poked; nothing here is a
//! module-level singleton. Tests reset it through [`JobsRuntime::reset`].
//!
//! - **start** is idempotent: a second call while running does nothing
//! - **stop** cancels the shared token and waits for every loop to return
//! - **pause/resume** flip a shared flag that loops check at their suspension points
//! - **poke** wakes a job out of its current sleep
//!
//! Loops see all of this through a [`JobContext`]. Every sleep goes through
//! [`JobContext::sleep_or_cancel`], so shutdown latency is bounded by the shortest sleep
//! slice rather than a full poll interval.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A long-running loop managed by [`JobsRuntime`]
#[async_trait]
pub trait BackgroundJob: Send + Sync + 'static {
    /// Registry key, also used for pokes
    fn job_id(&self) -> &'static str;

    /// Run until `ctx` is cancelled
    async fn run(self: Arc<Self>, ctx: JobContext);
}

/// How a [`JobContext::sleep_or_cancel`] call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Poked,
    Cancelled,
}

#[derive(Debug, Default)]
struct PauseControl {
    paused: AtomicBool,
    resumed: Notify,
}

/// Handle given to a running job
#[derive(Clone)]
pub struct JobContext {
    job_id: &'static str,
    cancel: CancellationToken,
    pause: Arc<PauseControl>,
    poke: Arc<Notify>,
}

impl JobContext {
    pub fn job_id(&self) -> &'static str {
        self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared shutdown token, for work that must stop between its own steps
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_paused(&self) -> bool {
        self.pause.paused.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless poked or cancelled first
    pub async fn sleep_or_cancel(&self, duration: Duration) -> Wake {
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = self.poke.notified() => Wake::Poked,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }

    /// Block while the runtime is paused; `false` when cancelled meanwhile
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let resumed = self.pause.resumed.notified();
            if !self.is_paused() {
                return true;
            }
            debug!(job_id = self.job_id, "Job paused");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = resumed => {}
            }
        }
    }
}

pub struct JobsRuntime {
    jobs: Mutex<Vec<Arc<dyn BackgroundJob>>>,
    cancel: Mutex<CancellationToken>,
    pause: Arc<PauseControl>,
    pokes: DashMap<String, Arc<Notify>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Default for JobsRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl JobsRuntime {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            pause: Arc::new(PauseControl::default()),
            pokes: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Add a job to be started by [`start`](Self::start); its poke slot exists immediately
    pub fn register(&self, job: Arc<dyn BackgroundJob>) {
        self.register_poke(job.job_id());
        self.jobs.lock().push(job);
    }

    /// Create the poke slot of `job_id` if it does not exist yet
    pub fn register_poke(&self, job_id: &str) -> Arc<Notify> {
        Arc::clone(
            self.pokes
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .value(),
        )
    }

    /// Wake `job_id` out of its current or next sleep; `false` for unknown jobs
    pub fn poke(&self, job_id: &str) -> bool {
        match self.pokes.get(job_id) {
            Some(notify) => {
                // notify_one stores a permit, so a poke between two sleeps is not lost
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Spawn every registered job; returns `false` if already running
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Jobs runtime already started");
            return false;
        }

        let cancel = self.cancel.lock().clone();
        let jobs = self.jobs.lock().clone();
        let mut handles = self.handles.lock();
        for job in jobs {
            let ctx = JobContext {
                job_id: job.job_id(),
                cancel: cancel.clone(),
                pause: Arc::clone(&self.pause),
                poke: self.register_poke(job.job_id()),
            };
            info!(job_id = job.job_id(), "Starting background job");
            handles.push(tokio::spawn(job.run(ctx)));
        }
        true
    }

    /// Cancel every job and wait for all of them to return
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        // A paused loop must observe the cancellation too
        self.pause.resumed.notify_waiters();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "Background job ended abnormally");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Jobs runtime stopped");
    }

    pub fn pause(&self) {
        self.pause.paused.store(true, Ordering::SeqCst);
        info!("Jobs paused");
    }

    pub fn resume(&self) {
        self.pause.paused.store(false, Ordering::SeqCst);
        self.pause.resumed.notify_waiters();
        info!("Jobs resumed");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.paused.load(Ordering::SeqCst)
    }

    /// Stop everything and forget registered jobs and poke slots
    #[doc(hidden)]
    pub async fn reset(&self) {
        self.stop().await;
        self.jobs.lock().clear();
        self.pokes.clear();
        self.pause.paused.store(false, Ordering::SeqCst);
    }
}
