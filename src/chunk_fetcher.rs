use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::active::ActiveDownloads;
use crate::error::EngineError;
use crate::pool::ConnectionPool;
use crate::rate_limiter::RateLimiter;
use crate::state_store::{now_secs, StateRecord, StateStore};
use crate::token_refresher::TokenRefresher;

const READ_CHUNK_SIZE: u64 = 65_536;
const SAVE_INTERVAL: Duration = Duration::from_secs(5);
const TOKEN_EXPIRED_STATUS: u16 = 458;

/// Everything one [`fetch`] call needs to know about its byte range.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub url: String,
    pub destination_path: PathBuf,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub index: usize,
    pub resume_from: u64,
}

/// A Job's resume checkpoint, shared by every [`ChunkSpec`] fetch of that
/// Job so saves from concurrent chunks serialize through one lock rather
/// than racing on the same state file.
pub struct JobProgress {
    record: AsyncMutex<StateRecord>,
    store: Arc<StateStore>,
    enable_resume: bool,
}

impl JobProgress {
    pub fn new(record: StateRecord, store: Arc<StateStore>, enable_resume: bool) -> Self {
        Self { record: AsyncMutex::new(record), store, enable_resume }
    }

    async fn checkpoint(&self, index: usize, bytes_written: u64) {
        if !self.enable_resume {
            return;
        }
        let mut record = self.record.lock().await;
        record.downloaded_chunks.insert(index, bytes_written);
        record.timestamp = now_secs();
        if let Err(e) = self.store.save(&record) {
            warn!(error = %e, "failed to persist resume state");
        }
    }

    pub async fn snapshot(&self) -> StateRecord {
        self.record.lock().await.clone()
    }
}

pub(crate) fn part_path(destination: &Path, index: usize) -> PathBuf {
    let mut os = destination.as_os_str().to_owned();
    os.push(format!(".part{index}"));
    PathBuf::from(os)
}

fn compose_range(start: Option<u64>, end: Option<u64>, resume_from: u64) -> Option<String> {
    match start {
        Some(s) => {
            let from = s + resume_from;
            Some(match end {
                Some(e) => format!("bytes={from}-{e}"),
                None => format!("bytes={from}-"),
            })
        }
        None if resume_from > 0 => Some(format!("bytes={resume_from}-")),
        None => None,
    }
}

enum AttemptOutcome {
    Success(u64),
    RestartFromZero,
    ProtocolMismatch,
    TokenExpired,
    ServerError(u16),
    /// Carries the number of bytes actually on disk for this chunk when the
    /// attempt failed, so the next attempt resumes from there instead of
    /// re-requesting bytes already written.
    Transport(EngineError, u64),
}

/// Downloads one byte range into `<destination>.part<index>`, retrying
/// transient and authentication failures up to `retry_count` times.
///
/// Returns the number of bytes written to the part file on success.
pub async fn fetch(
    client: &Client,
    rate_limiter: &RateLimiter,
    pool: &ConnectionPool,
    token_refresher: &TokenRefresher,
    active: &ActiveDownloads,
    progress: &JobProgress,
    retry_count: u32,
    spec: ChunkSpec,
) -> Result<u64, EngineError> {
    let part_path = part_path(&spec.destination_path, spec.index);
    let chunk_total = match (spec.start, spec.end) {
        (Some(s), Some(e)) => Some(e - s + 1),
        _ => None,
    };
    let mut url = spec.url.clone();
    let mut resume_from = spec.resume_from;
    let mut last_error = None;

    active.start(&url, &spec.destination_path, spec.index, chunk_total).await;

    for attempt in 1..=retry_count.max(1) {
        let outcome = attempt_once(
            client,
            rate_limiter,
            pool,
            active,
            progress,
            &url,
            &part_path,
            &spec,
            resume_from,
            chunk_total,
        )
        .await?;

        match outcome {
            AttemptOutcome::Success(bytes) => {
                active.finish(&spec.destination_path, spec.index).await;
                return Ok(bytes);
            }
            AttemptOutcome::RestartFromZero => {
                info!(index = spec.index, "server ignored range request on chunk 0, restarting from zero");
                resume_from = 0;
                last_error = Some(EngineError::HttpStatus(200));
            }
            AttemptOutcome::ProtocolMismatch => {
                active.finish(&spec.destination_path, spec.index).await;
                return Err(EngineError::ProtocolMismatch(spec.index));
            }
            AttemptOutcome::TokenExpired => {
                if let Ok(refreshed) = token_refresher.refresh(&url).await {
                    url = refreshed;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                last_error = Some(EngineError::HttpStatus(TOKEN_EXPIRED_STATUS));
            }
            AttemptOutcome::ServerError(status) => {
                rate_limiter.signal_error(&url).await;
                last_error = Some(EngineError::HttpStatus(status));
            }
            AttemptOutcome::Transport(e, written) => {
                let backoff = Duration::from_secs(2 * attempt as u64);
                debug!(
                    index = spec.index,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    bytes_written = written,
                    "chunk fetch retrying"
                );
                resume_from = written;
                last_error = Some(e);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    active.finish(&spec.destination_path, spec.index).await;
    if !progress.enable_resume {
        let _ = tokio::fs::remove_file(&part_path).await;
    }
    Err(last_error.unwrap_or_else(|| EngineError::Network("chunk fetch exhausted retries".to_string())))
}

#[allow(clippy::too_many_arguments)]
async fn attempt_once(
    client: &Client,
    rate_limiter: &RateLimiter,
    pool: &ConnectionPool,
    active: &ActiveDownloads,
    progress: &JobProgress,
    url: &str,
    part_path: &Path,
    spec: &ChunkSpec,
    resume_from: u64,
    chunk_total: Option<u64>,
) -> Result<AttemptOutcome, EngineError> {
    let guard = pool.acquire(url).await?;

    let mut file = if resume_from > 0 && tokio::fs::try_exists(part_path).await.unwrap_or(false) {
        tokio::fs::OpenOptions::new().append(true).create(true).open(part_path).await?
    } else {
        tokio::fs::OpenOptions::new().write(true).create(true).truncate(true).open(part_path).await?
    };

    rate_limiter.await_tokens(url, READ_CHUNK_SIZE).await;

    let range = compose_range(spec.start, spec.end, resume_from);
    let mut request = client
        .get(url)
        .header("User-Agent", "VLC/3.0.16 LibVLC/3.0.16")
        .header("Accept", "*/*")
        .header("Connection", "keep-alive");
    if let Some(range) = &range {
        request = request.header("Range", range);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            drop(guard);
            return Ok(AttemptOutcome::Transport(e.into(), resume_from));
        }
    };

    let status = response.status();
    if status.as_u16() == TOKEN_EXPIRED_STATUS {
        drop(guard);
        return Ok(AttemptOutcome::TokenExpired);
    }
    if status.as_u16() == 200 && range.is_some() {
        drop(guard);
        return Ok(if spec.index == 0 {
            AttemptOutcome::RestartFromZero
        } else {
            AttemptOutcome::ProtocolMismatch
        });
    }
    if status.as_u16() != 200 && status.as_u16() != 206 {
        drop(guard);
        return Ok(AttemptOutcome::ServerError(status.as_u16()));
    }

    let mut total_written = resume_from;
    let mut stream = response.bytes_stream();
    let mut last_save = Instant::now();
    let attempt_start = Instant::now();
    let mut bytes_this_attempt = 0u64;

    loop {
        let item = match stream.next().await {
            Some(item) => item,
            None => break,
        };

        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(guard);
                if let Err(flush_err) = file.flush().await {
                    return Err(flush_err.into());
                }
                return Ok(AttemptOutcome::Transport(e.into(), total_written));
            }
        };

        if let Err(e) = file.write_all(&bytes).await {
            drop(guard);
            return Err(e.into());
        }

        let len = bytes.len() as u64;
        total_written += len;
        bytes_this_attempt += len;

        active.update(&spec.destination_path, spec.index, total_written).await;

        if last_save.elapsed() >= SAVE_INTERVAL {
            progress.checkpoint(spec.index, total_written).await;
            last_save = Instant::now();
        }

        rate_limiter.await_tokens(url, READ_CHUNK_SIZE).await;
    }

    if let Err(e) = file.flush().await {
        drop(guard);
        return Err(e.into());
    }
    drop(guard);

    let elapsed = attempt_start.elapsed().as_secs_f64();
    rate_limiter.record_throughput(url, bytes_this_attempt, elapsed).await;
    progress.checkpoint(spec.index, total_written).await;

    if let Some(planned) = chunk_total {
        if total_written < planned {
            return Ok(AttemptOutcome::Transport(
                EngineError::Network(format!(
                    "chunk {} closed at {} of {} planned bytes",
                    spec.index, total_written, planned
                )),
                total_written,
            ));
        }
    }

    Ok(AttemptOutcome::Success(total_written))
}
