//! # Refresh System Bootstrap
//!
//! Wires the pipeline from a [`RefreshConfig`], a store and a feed client: queue, fetcher,
//! resolver with its throttled backup writer, refresh requester and the two background
//! jobs. The binary and the integration tests both go through [`RefreshSystem::build`].

use std::sync::Arc;
use tracing::info;

use super::backfill::BackfillScanner;
use super::jobs::JobsRuntime;
use super::refresh_requests::RefreshRequester;
use super::worker::RefreshWorker;
use crate::backup::{BackupWriter, ThrottledBackupWriter};
use crate::config::RefreshConfig;
use crate::database::RefreshStore;
use crate::error::Result;
use crate::fetch::{EventsResolver, FeedClient, IcsParser, UpstreamFetcher};
use crate::models::OpsSnapshot;
use crate::queue::WorkQueue;
use crate::resilience::BackoffPolicy;

pub struct RefreshSystem {
    config: RefreshConfig,
    store: Arc<dyn RefreshStore>,
    queue: Arc<WorkQueue>,
    resolver: Arc<EventsResolver>,
    requester: Arc<RefreshRequester>,
    worker: Arc<RefreshWorker>,
    backfill: Option<Arc<BackfillScanner>>,
    jobs: Arc<JobsRuntime>,
}

impl RefreshSystem {
    pub fn build(
        config: &RefreshConfig,
        store: Arc<dyn RefreshStore>,
        client: Arc<dyn FeedClient>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new(
            Arc::clone(&store),
            &config.queue,
            BackoffPolicy::new(&config.backoff),
        ));
        let fetcher = Arc::new(UpstreamFetcher::new(client, Arc::new(IcsParser)));
        let backup = BackupWriter::new(Arc::clone(&store));

        let throttled_backup = Arc::new(ThrottledBackupWriter::new(backup.clone(), &config.backup));
        let resolver = Arc::new(
            EventsResolver::new(
                Arc::clone(&fetcher),
                Arc::clone(&store),
                config.coalescer.max_in_flight_keys,
            )
            .with_backup_writer(throttled_backup),
        );

        let jobs = Arc::new(JobsRuntime::new());
        let worker = Arc::new(RefreshWorker::new(
            Arc::clone(&queue),
            fetcher,
            backup,
            config.worker.clone(),
        ));
        jobs.register(worker.clone());

        let backfill = if config.backfill.enabled {
            let scanner = Arc::new(BackfillScanner::from_config(
                Arc::clone(&queue),
                &config.backfill,
            )?);
            jobs.register(scanner.clone());
            Some(scanner)
        } else {
            None
        };

        let requester = Arc::new(RefreshRequester::new(
            Arc::clone(&queue),
            Arc::clone(&jobs),
            &config.refresh_requests,
        ));

        info!(
            worker_id = worker.worker_id(),
            backfill = backfill.is_some(),
            "Refresh system assembled"
        );

        Ok(Self {
            config: config.clone(),
            store,
            queue,
            resolver,
            requester,
            worker,
            backfill,
            jobs,
        })
    }

    /// Start the background jobs; `false` if they were already running
    pub fn start(&self) -> bool {
        self.jobs.start()
    }

    /// Stop the background jobs and wait for them to return
    pub async fn stop(&self) {
        self.jobs.stop().await;
    }

    pub async fn snapshot(&self) -> Result<OpsSnapshot> {
        self.queue.snapshot(self.config.worker.snapshot_top_n).await
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RefreshStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<EventsResolver> {
        &self.resolver
    }

    pub fn requester(&self) -> &Arc<RefreshRequester> {
        &self.requester
    }

    pub fn worker(&self) -> &Arc<RefreshWorker> {
        &self.worker
    }

    pub fn backfill(&self) -> Option<&Arc<BackfillScanner>> {
        self.backfill.as_ref()
    }

    pub fn jobs(&self) -> &Arc<JobsRuntime> {
        &self.jobs
    }
}
