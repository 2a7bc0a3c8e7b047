use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;
const DEFAULT_RATE_BYTES_PER_SEC: f64 = 5.0 * MIB as f64;
const SPEED_HISTORY_LEN: usize = 5;
const MAX_BACKOFF: f64 = 8.0;
const BACKOFF_DECAY: f64 = 0.9;
const BACKOFF_STEP: f64 = 1.5;

/// One chunk of a [`crate::rate_limiter::plan_chunks`] layout: `end` is
/// `None` only for the final chunk of an unknown-size transfer, or for
/// the sole chunk of a server that refuses range requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
}

pub type ChunkPlan = Vec<ChunkRange>;

/// Per-URL token-bucket state.
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    backoff_multiplier: f64,
}

impl RateBucket {
    fn new() -> Self {
        Self {
            tokens: 0.0,
            last_refill: Instant::now(),
            backoff_multiplier: 1.0,
        }
    }
}

/// Splits `file_size` bytes into a contiguous, non-overlapping [`ChunkPlan`].
///
/// Tier selection and remainder handling follow spec.md §4.1 exactly:
/// `<1 MiB -> 1`, `<10 MiB -> min(2, max)`, `<100 MiB -> min(4, max)`,
/// otherwise `max`. A `file_size` of 0 (unknown length) yields a single
/// open-ended chunk.
pub fn plan_chunks(file_size: u64, max_chunks: usize) -> ChunkPlan {
    if file_size == 0 {
        return vec![ChunkRange {
            index: 0,
            start: 0,
            end: None,
        }];
    }

    let max_chunks = max_chunks.max(1);
    let num_chunks = if file_size < MIB {
        1
    } else if file_size < 10 * MIB {
        max_chunks.min(2)
    } else if file_size < 100 * MIB {
        max_chunks.min(4)
    } else {
        max_chunks
    };

    let chunk_size = file_size / num_chunks as u64;
    let mut plan = Vec::with_capacity(num_chunks);
    for i in 0..num_chunks {
        let start = i as u64 * chunk_size;
        let end = if i == num_chunks - 1 {
            file_size - 1
        } else {
            (i as u64 + 1) * chunk_size - 1
        };
        plan.push(ChunkRange {
            index: i,
            start,
            end: Some(end),
        });
    }
    plan
}

/// Token-bucket rate limiter with adaptive per-URL backoff, shared by every
/// [`crate::chunk_fetcher`] task in an engine instance.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, RateBucket>>,
    speed_history: Mutex<HashMap<String, VecDeque<f64>>>,
    global_limit: Mutex<Option<u64>>,
    max_chunk_size: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_global_limit(None)
    }

    /// Builds a limiter with its global cap already set, so a configured
    /// speed limit is in effect from the first `await_tokens` call.
    pub fn with_global_limit(bytes_per_second: Option<u64>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            speed_history: Mutex::new(HashMap::new()),
            global_limit: Mutex::new(bytes_per_second),
            max_chunk_size: 4 * MIB,
        }
    }

    pub async fn set_global_limit(&self, bytes_per_second: Option<u64>) {
        *self.global_limit.lock().await = bytes_per_second;
    }

    async fn average_observed_speed(&self, url: &str) -> Option<f64> {
        let history = self.speed_history.lock().await;
        let samples = history.get(url)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    async fn effective_rate(&self, url: &str, backoff_multiplier: f64) -> f64 {
        if let Some(limit) = *self.global_limit.lock().await {
            return limit as f64 / backoff_multiplier;
        }
        if let Some(avg) = self.average_observed_speed(url).await {
            return 1.2 * avg;
        }
        DEFAULT_RATE_BYTES_PER_SEC
    }

    /// Blocks until the per-URL bucket holds at least `bytes` tokens.
    pub async fn await_tokens(&self, url: &str, bytes: u64) {
        let bytes = bytes as f64;
        loop {
            let (need_sleep, sleep_secs, backoff) = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(url.to_string()).or_insert_with(RateBucket::new);

                let now = Instant::now();
                let delta = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.last_refill = now;

                let rate = self.effective_rate(url, bucket.backoff_multiplier).await;
                bucket.tokens = (bucket.tokens + delta * rate).min(2.0 * self.max_chunk_size as f64);

                if bucket.tokens >= bytes {
                    bucket.tokens -= bytes;
                    (false, 0.0, bucket.backoff_multiplier)
                } else {
                    let deficit = bytes - bucket.tokens;
                    let sleep_secs = deficit / rate;
                    (true, sleep_secs, bucket.backoff_multiplier)
                }
            };

            if !need_sleep {
                return;
            }

            let jitter = rand::thread_rng().gen_range(1.0..1.1);
            let sleep_for = Duration::from_secs_f64((sleep_secs * jitter).max(0.0));
            debug!(url, backoff, sleep_ms = sleep_for.as_millis() as u64, "rate limiter sleeping");
            tokio::time::sleep(sleep_for).await;

            let mut buckets = self.buckets.lock().await;
            if let Some(bucket) = buckets.get_mut(url) {
                bucket.tokens = 0.0;
                bucket.last_refill = Instant::now();
            }
        }
    }

    /// Records a completed transfer sample and decays backoff toward 1.0.
    pub async fn record_throughput(&self, url: &str, bytes: u64, elapsed_seconds: f64) {
        if elapsed_seconds <= 0.0 {
            return;
        }
        let speed = bytes as f64 / elapsed_seconds;

        {
            let mut history = self.speed_history.lock().await;
            let samples = history.entry(url.to_string()).or_insert_with(VecDeque::new);
            samples.push_back(speed);
            while samples.len() > SPEED_HISTORY_LEN {
                samples.pop_front();
            }
        }

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(url.to_string()).or_insert_with(RateBucket::new);
        if bucket.backoff_multiplier > 1.0 {
            bucket.backoff_multiplier = (bucket.backoff_multiplier * BACKOFF_DECAY).max(1.0);
        }
    }

    /// Increases backoff after a server error, capped at 8x.
    pub async fn signal_error(&self, url: &str) {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(url.to_string()).or_insert_with(RateBucket::new);
        bucket.backoff_multiplier = (bucket.backoff_multiplier * BACKOFF_STEP).min(MAX_BACKOFF);
        warn!(url, backoff = bucket.backoff_multiplier, "rate limiter backing off");
    }

    /// Current average observed speed for `url`, or 0 if no samples yet.
    pub async fn observed_speed(&self, url: &str) -> f64 {
        self.average_observed_speed(url).await.unwrap_or(0.0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_chunks_unknown_size_is_single_open_chunk() {
        let plan = plan_chunks(0, 4);
        assert_eq!(plan, vec![ChunkRange { index: 0, start: 0, end: None }]);
    }

    #[test]
    fn plan_chunks_small_file_is_single_chunk() {
        let plan = plan_chunks(500_000, 8);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan[0].end, Some(499_999));
    }

    #[test]
    fn plan_chunks_one_byte_file() {
        let plan = plan_chunks(1, 8);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].end, Some(0));
    }

    #[test]
    fn plan_chunks_mid_tier_caps_at_two() {
        let plan = plan_chunks(5 * MIB, 8);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn plan_chunks_large_tier_caps_at_four() {
        let plan = plan_chunks(50 * MIB, 8);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn plan_chunks_huge_file_uses_max() {
        let plan = plan_chunks(500 * MIB, 8);
        assert_eq!(plan.len(), 8);
    }

    #[test]
    fn plan_chunks_covers_file_contiguously_no_overlap() {
        let plan = plan_chunks(1_048_576, 4);
        assert_eq!(plan.len(), 4);
        let mut expected_start = 0u64;
        for c in &plan {
            assert_eq!(c.start, expected_start);
            expected_start = c.end.unwrap() + 1;
        }
        assert_eq!(plan.last().unwrap().end, Some(1_048_576 - 1));
    }

    #[test]
    fn plan_chunks_remainder_absorbed_by_last_chunk() {
        // 10 bytes over 3 chunks: sizes 3,3,4 with no gap/overlap.
        let plan = plan_chunks(10, 3);
        // file_size (10) < 1 MiB so this collapses to a single chunk by tier rules;
        // use a size that lands in the "huge" tier instead to exercise true division remainder.
        assert_eq!(plan.len(), 1);

        let plan = plan_chunks(100 * MIB + 10, 4);
        assert_eq!(plan.len(), 4);
        let total_end = plan.last().unwrap().end.unwrap();
        assert_eq!(total_end, 100 * MIB + 10 - 1);
        let mut cursor = 0u64;
        for c in &plan {
            assert_eq!(c.start, cursor);
            cursor = c.end.unwrap() + 1;
        }
    }

    #[tokio::test]
    async fn await_tokens_does_not_block_when_bucket_is_full() {
        let limiter = RateLimiter::new();
        limiter.set_global_limit(Some(10 * MIB)).await;
        // First call seeds the bucket at 0 tokens then must wait; instead prime
        // the bucket via a tiny request, then a second call within budget should
        // not sleep because the refill since-epoch already covers it.
        let start = Instant::now();
        limiter.await_tokens("http://x/a.ts", 1).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn signal_error_increases_backoff_and_caps_at_eight() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.signal_error("http://x/a.ts").await;
        }
        let buckets = limiter.buckets.lock().await;
        let bucket = buckets.get("http://x/a.ts").unwrap();
        assert!((bucket.backoff_multiplier - MAX_BACKOFF).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_throughput_decays_backoff_toward_one() {
        let limiter = RateLimiter::new();
        limiter.signal_error("http://x/a.ts").await;
        let before = {
            let buckets = limiter.buckets.lock().await;
            buckets.get("http://x/a.ts").unwrap().backoff_multiplier
        };
        limiter.record_throughput("http://x/a.ts", 1_000_000, 1.0).await;
        let after = {
            let buckets = limiter.buckets.lock().await;
            buckets.get("http://x/a.ts").unwrap().backoff_multiplier
        };
        assert!(after < before);
        assert!(after >= 1.0);
    }
}
