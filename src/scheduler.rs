//! Drives a batch of Jobs concurrently against one engine instance.
//!
//! Concurrency itself is enforced by the [`crate::pool::ConnectionPool`];
//! this module only bounds how many Jobs are *launched* at once, mirroring
//! the source's `DownloadManager.start_downloads`.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::active::{ActiveDownloads, DestinationProgress};
use crate::error::EngineError;
use crate::file_downloader::{FileDownloader, ProgressCallback};
use crate::job::Job;
use crate::rate_limiter::RateLimiter;
use crate::state_store::{StateRecord, StateStore};

/// Outcome of one Job, with failures isolated from their siblings.
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<(), EngineError>,
}

pub struct BatchScheduler {
    downloader: Arc<FileDownloader>,
    active: Arc<ActiveDownloads>,
    state_store: Arc<StateStore>,
    rate_limiter: Arc<RateLimiter>,
    max_concurrent_files: usize,
}

impl BatchScheduler {
    pub fn new(
        downloader: Arc<FileDownloader>,
        active: Arc<ActiveDownloads>,
        state_store: Arc<StateStore>,
        rate_limiter: Arc<RateLimiter>,
        max_concurrent_files: usize,
    ) -> Self {
        Self { downloader, active, state_store, rate_limiter, max_concurrent_files: max_concurrent_files.max(1) }
    }

    /// Runs every Job, bounded by `max_concurrent_files` concurrent launches.
    /// One Job's failure never cancels its siblings.
    pub async fn run(&self, jobs: Vec<Job>, progress_callback: Option<ProgressCallback>) -> Vec<JobOutcome> {
        let downloader = self.downloader.clone();
        stream::iter(jobs.into_iter().map(|job| {
            let downloader = downloader.clone();
            let callback = progress_callback.clone();
            async move {
                let result = downloader.download(&job, callback).await;
                if let Err(e) = &result {
                    warn!(destination = %job.destination_path.display(), error = %e, "job failed");
                }
                JobOutcome { job, result }
            }
        }))
        .buffer_unordered(self.max_concurrent_files)
        .collect()
        .await
    }

    /// Folds every in-flight chunk into a per-destination aggregate, with
    /// `speed_bytes_per_second` set to the maximum observed speed across
    /// that destination's in-flight URLs (spec.md §4.7).
    pub async fn get_active_downloads(&self) -> Vec<DestinationProgress> {
        let mut aggregates = self.active.aggregate_by_destination().await;
        let urls_by_destination = self.active.urls_by_destination().await;

        for aggregate in &mut aggregates {
            let Some(urls) = urls_by_destination.get(&aggregate.destination_path) else {
                continue;
            };
            let mut max_speed = 0.0f64;
            for url in urls {
                let speed = self.rate_limiter.observed_speed(url).await;
                if speed > max_speed {
                    max_speed = speed;
                }
            }
            aggregate.speed_bytes_per_second = max_speed;
        }

        aggregates
    }

    /// Lists every on-disk resume checkpoint, for a caller to re-offer as Jobs.
    pub fn list_resumable(&self) -> Vec<StateRecord> {
        self.state_store.list_incomplete()
    }

    /// Rebuilds Jobs from every resumable checkpoint and runs them.
    pub async fn resume_all(&self, progress_callback: Option<ProgressCallback>) -> Vec<JobOutcome> {
        let jobs = self.list_resumable().into_iter().map(|record| Job::new(record.url, record.filepath)).collect();
        self.run(jobs, progress_callback).await
    }
}
