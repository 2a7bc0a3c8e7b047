//! Concurrent, resumable HTTP downloader tuned for IPTV-style media streams.
//!
//! [`Engine`] wires together the seven collaborating components — rate
//! limiter, connection pool, resume-state store, token refresher, chunk
//! fetcher, file downloader and batch scheduler — into the single entry
//! point external callers drive.

pub mod active;
pub mod checksum;
pub mod chunk_fetcher;
pub mod config;
pub mod error;
pub mod file_downloader;
pub mod job;
pub mod pool;
pub mod rate_limiter;
pub mod scheduler;
pub mod state_store;
pub mod token_refresher;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

pub use active::{ActiveDownloads, DestinationProgress};
pub use config::EngineConfig;
pub use error::EngineError;
pub use file_downloader::ProgressCallback;
pub use job::Job;
pub use scheduler::JobOutcome;
pub use state_store::StateRecord;

use file_downloader::FileDownloader;
use pool::ConnectionPool;
use rate_limiter::RateLimiter;
use scheduler::BatchScheduler;
use state_store::StateStore;
use token_refresher::TokenRefresher;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Top-level facade: constructs the shared collaborators from [`EngineConfig`]
/// and exposes the operations an external caller (playlist parser, UI) needs.
pub struct Engine {
    scheduler: BatchScheduler,
    rate_limiter: Arc<RateLimiter>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(EngineError::from)?;

        let rate_limiter = Arc::new(RateLimiter::with_global_limit(config.max_speed_limit_bytes_per_second));
        let pool = Arc::new(ConnectionPool::new(
            config.max_concurrent_files * 2,
            config.max_concurrent_files.max(1),
        ));
        let token_refresher = Arc::new(TokenRefresher::new(client.clone()));
        let active = Arc::new(ActiveDownloads::new());
        let state_store = Arc::new(StateStore::new(config.state_dir.clone()));

        let downloader = Arc::new(FileDownloader::new(
            client,
            rate_limiter.clone(),
            pool,
            token_refresher,
            active.clone(),
            state_store.clone(),
            config.clone(),
        ));

        let scheduler =
            BatchScheduler::new(downloader, active, state_store, rate_limiter.clone(), config.max_concurrent_files);

        Ok(Self { scheduler, rate_limiter })
    }

    /// Caps aggregate throughput across every Job sharing this engine instance.
    pub async fn set_speed_limit(&self, bytes_per_second: Option<u64>) {
        self.rate_limiter.set_global_limit(bytes_per_second).await;
    }

    /// Runs `jobs` concurrently, bounded by `EngineConfig::max_concurrent_files`.
    pub async fn run(&self, jobs: Vec<Job>, progress_callback: Option<ProgressCallback>) -> Vec<JobOutcome> {
        self.scheduler.run(jobs, progress_callback).await
    }

    /// Snapshot of every chunk currently in flight, aggregated per destination.
    pub async fn active_downloads(&self) -> Vec<DestinationProgress> {
        self.scheduler.get_active_downloads().await
    }

    /// Lists every on-disk checkpoint left behind by an interrupted run.
    pub fn resumable_jobs(&self) -> Vec<StateRecord> {
        self.scheduler.list_resumable()
    }

    /// Resumes and runs every job found by [`Engine::resumable_jobs`].
    pub async fn resume_all(&self, progress_callback: Option<ProgressCallback>) -> Vec<JobOutcome> {
        self.scheduler.resume_all(progress_callback).await
    }
}
