use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::active::ActiveDownloads;
use crate::chunk_fetcher::{self, ChunkSpec, JobProgress};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job::Job;
use crate::pool::ConnectionPool;
use crate::rate_limiter::{self, RateLimiter};
use crate::state_store::{StateRecord, StateStore};
use crate::token_refresher::{self, TokenRefresher};

/// `(filename, percent_0_to_100, speed_string)`, invoked on successful
/// progress only — failures are reported solely through the return value.
pub type ProgressCallback = Arc<dyn Fn(&str, f64, Option<String>) + Send + Sync>;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Orchestrates one [`Job`]: probes the server, plans the chunk layout,
/// drives its [`crate::chunk_fetcher`] tasks, and merges the result.
pub struct FileDownloader {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPool>,
    token_refresher: Arc<TokenRefresher>,
    active: Arc<ActiveDownloads>,
    state_store: Arc<StateStore>,
    config: EngineConfig,
}

impl FileDownloader {
    pub fn new(
        client: Client,
        rate_limiter: Arc<RateLimiter>,
        pool: Arc<ConnectionPool>,
        token_refresher: Arc<TokenRefresher>,
        active: Arc<ActiveDownloads>,
        state_store: Arc<StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self { client, rate_limiter, pool, token_refresher, active, state_store, config }
    }

    /// Runs `job` to completion, retrying the whole job up to `retry_count`
    /// times with exponential backoff between attempts.
    pub async fn download(&self, job: &Job, progress_callback: Option<ProgressCallback>) -> Result<(), EngineError> {
        let mut last_error = None;

        for attempt in 1..=self.config.retry_count.max(1) {
            match self.try_download(job, progress_callback.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(destination = %job.destination_path.display(), attempt, error = %e, "job attempt failed");
                    self.rate_limiter.signal_error(&job.source_url).await;
                    last_error = Some(e);
                    if attempt < self.config.retry_count {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    }
                }
            }
        }

        Err(EngineError::JobFailed {
            destination: job.destination_path.display().to_string(),
            source: Box::new(last_error.unwrap_or(EngineError::Network("job retries exhausted".to_string()))),
        })
    }

    async fn try_download(&self, job: &Job, progress_callback: Option<ProgressCallback>) -> Result<(), EngineError> {
        let mut url = job.source_url.clone();
        if token_refresher::has_play_token(&url) {
            url = self.token_refresher.refresh(&url).await.unwrap_or(url);
        }

        let resume_hint = self.state_store.load(&job.destination_path);

        let (supports_range, total_size) = probe(&self.client, &url).await?;

        let plan = if self.config.enable_chunked && supports_range && total_size > 0 {
            rate_limiter::plan_chunks(total_size, self.config.max_chunks_per_file)
        } else {
            vec![rate_limiter::ChunkRange { index: 0, start: 0, end: None }]
        };
        let single_chunk_fallback = !(self.config.enable_chunked && supports_range && total_size > 0);

        let resume_valid = resume_hint
            .as_ref()
            .map(|r| r.url == job.source_url && r.total_size == total_size)
            .unwrap_or(false);
        let mut resume_map: HashMap<usize, u64> =
            if resume_valid { resume_hint.unwrap().downloaded_chunks } else { HashMap::new() };

        if single_chunk_fallback && !resume_map.contains_key(&0) {
            let part0 = chunk_fetcher::part_path(&job.destination_path, 0);
            if let Ok(meta) = tokio::fs::metadata(&part0).await {
                resume_map.insert(0, meta.len());
            }
        }

        let chunk_ranges: Vec<(u64, Option<u64>)> = plan.iter().map(|c| (c.start, c.end)).collect();
        let record = StateRecord::new(&job.destination_path, &job.source_url, total_size, chunk_ranges, resume_map.clone());
        let progress = Arc::new(JobProgress::new(record, self.state_store.clone(), self.config.enable_resume));

        let specs: Vec<ChunkSpec> = plan
            .iter()
            .map(|c| ChunkSpec {
                url: url.clone(),
                destination_path: job.destination_path.clone(),
                start: if single_chunk_fallback { None } else { Some(c.start) },
                end: if single_chunk_fallback { None } else { c.end },
                index: c.index,
                resume_from: *resume_map.get(&c.index).unwrap_or(&0),
            })
            .collect();

        let poll_handle = progress_callback.map(|cb| self.spawn_progress_poll(job, total_size, cb));

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let client = self.client.clone();
            let rate_limiter = self.rate_limiter.clone();
            let pool = self.pool.clone();
            let token_refresher = self.token_refresher.clone();
            let active = self.active.clone();
            let progress = progress.clone();
            let retry_count = self.config.retry_count;
            handles.push(tokio::spawn(async move {
                chunk_fetcher::fetch(&client, &rate_limiter, &pool, &token_refresher, &active, &progress, retry_count, spec)
                    .await
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_bytes)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(EngineError::Io(join_err.to_string()));
                }
            }
        }

        if let Some(poll_handle) = poll_handle {
            poll_handle.abort();
        }

        if let Some(e) = first_error {
            if !self.config.enable_resume {
                for c in &plan {
                    let _ = tokio::fs::remove_file(chunk_fetcher::part_path(&job.destination_path, c.index)).await;
                }
            }
            return Err(e);
        }

        merge_parts(&job.destination_path, plan.len()).await?;
        self.state_store.clear(&job.destination_path);
        info!(destination = %job.destination_path.display(), "job completed");
        Ok(())
    }

    fn spawn_progress_poll(&self, job: &Job, total_size: u64, callback: ProgressCallback) -> tokio::task::JoinHandle<()> {
        let active = self.active.clone();
        let rate_limiter = self.rate_limiter.clone();
        let destination = job.destination_path.clone();
        let url = job.source_url.clone();
        let filename = destination.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
                let aggregates = active.aggregate_by_destination().await;
                let Some(agg) = aggregates.iter().find(|a| a.destination_path == destination) else {
                    continue;
                };
                let percent = if total_size > 0 { (agg.bytes_written as f64 / total_size as f64) * 100.0 } else { 0.0 };
                let speed = rate_limiter.observed_speed(&url).await;
                let speed_string = if speed > 0.0 { Some(format_speed(speed)) } else { None };
                callback(&filename, percent.min(100.0), speed_string);
            }
        })
    }
}

async fn probe(client: &Client, url: &str) -> Result<(bool, u64), EngineError> {
    let response = client
        .head(url)
        .header("User-Agent", "VLC/3.0.16 LibVLC/3.0.16")
        .send()
        .await?;

    let supports_range = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "bytes")
        .unwrap_or(false);

    let total_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    Ok((supports_range, total_size))
}

async fn merge_parts(destination: &Path, chunk_count: usize) -> Result<(), EngineError> {
    if chunk_count <= 1 {
        let part = chunk_fetcher::part_path(destination, 0);
        tokio::fs::rename(&part, destination).await?;
        return Ok(());
    }

    let mut out = tokio::fs::File::create(destination).await?;
    for index in 0..chunk_count {
        let part = chunk_fetcher::part_path(destination, index);
        let mut part_file = tokio::fs::File::open(&part).await?;
        tokio::io::copy(&mut part_file, &mut out).await?;
        drop(part_file);
        tokio::fs::remove_file(&part).await?;
    }
    out.flush().await?;
    Ok(())
}

fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{bytes_per_sec:.1} B/s")
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_speed_picks_units_by_magnitude() {
        assert_eq!(format_speed(500.0), "500.0 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(5.0 * 1024.0 * 1024.0), "5.0 MB/s");
    }

    #[tokio::test]
    async fn merge_parts_single_chunk_renames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        let part0 = chunk_fetcher::part_path(&dest, 0);
        tokio::fs::write(&part0, b"hello world").await.unwrap();

        merge_parts(&dest, 1).await.unwrap();
        let body = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(body, b"hello world");
        assert!(!part0.exists());
    }

    #[tokio::test]
    async fn merge_parts_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        tokio::fs::write(chunk_fetcher::part_path(&dest, 0), b"AAAA").await.unwrap();
        tokio::fs::write(chunk_fetcher::part_path(&dest, 1), b"BBBB").await.unwrap();
        tokio::fs::write(chunk_fetcher::part_path(&dest, 2), b"CCCC").await.unwrap();

        merge_parts(&dest, 3).await.unwrap();
        let body = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(body, b"AAAABBBBCCCC");
        assert!(!chunk_fetcher::part_path(&dest, 0).exists());
        assert!(!chunk_fetcher::part_path(&dest, 1).exists());
        assert!(!chunk_fetcher::part_path(&dest, 2).exists());
    }
}
