use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// One in-flight chunk fetch, keyed by `(destination_path, chunk_index)`.
///
/// Replaces the source's `path + "_" + index` string key (spec.md §9) with a
/// typed tuple key so aggregation never depends on string parsing.
#[derive(Debug, Clone)]
pub struct ActiveDownload {
    pub url: String,
    pub destination_path: PathBuf,
    pub chunk_index: usize,
    pub bytes_written: u64,
    pub chunk_total: Option<u64>,
}

/// Per-destination roll-up used by [`crate::scheduler::BatchScheduler::get_active_downloads`].
///
/// `speed_bytes_per_second` is left at `0.0` by [`ActiveDownloads::aggregate_by_destination`]
/// itself (it has no access to the rate limiter's history) and is filled in
/// by the caller that does — see `BatchScheduler::get_active_downloads`.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationProgress {
    pub destination_path: PathBuf,
    pub bytes_written: u64,
    pub chunk_count: usize,
    pub speed_bytes_per_second: f64,
}

type Key = (PathBuf, usize);

/// Registry of [`ActiveDownload`] entries, shared by every [`crate::chunk_fetcher::ChunkFetcher`]
/// of one engine instance.
#[derive(Default)]
pub struct ActiveDownloads {
    entries: Mutex<HashMap<Key, ActiveDownload>>,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Registers a chunk fetch as starting. Called once, at fetch start.
    pub async fn start(&self, url: &str, destination_path: &Path, chunk_index: usize, chunk_total: Option<u64>) {
        let key = (destination_path.to_path_buf(), chunk_index);
        self.entries.lock().await.insert(
            key,
            ActiveDownload {
                url: url.to_string(),
                destination_path: destination_path.to_path_buf(),
                chunk_index,
                bytes_written: 0,
                chunk_total,
            },
        );
    }

    /// Updates the byte count for an in-flight chunk after a successful write.
    pub async fn update(&self, destination_path: &Path, chunk_index: usize, bytes_written: u64) {
        let key = (destination_path.to_path_buf(), chunk_index);
        if let Some(entry) = self.entries.lock().await.get_mut(&key) {
            entry.bytes_written = bytes_written;
        }
    }

    /// Removes the entry, whether the chunk completed or errored.
    pub async fn finish(&self, destination_path: &Path, chunk_index: usize) {
        let key = (destination_path.to_path_buf(), chunk_index);
        self.entries.lock().await.remove(&key);
    }

    /// Folds every active chunk into one aggregate per destination path,
    /// summing bytes written across chunks. Speed is left at `0.0`; see
    /// [`DestinationProgress`].
    pub async fn aggregate_by_destination(&self) -> Vec<DestinationProgress> {
        let entries = self.entries.lock().await;
        let mut aggregates: HashMap<PathBuf, DestinationProgress> = HashMap::new();
        for entry in entries.values() {
            let agg = aggregates.entry(entry.destination_path.clone()).or_insert_with(|| DestinationProgress {
                destination_path: entry.destination_path.clone(),
                bytes_written: 0,
                chunk_count: 0,
                speed_bytes_per_second: 0.0,
            });
            agg.bytes_written += entry.bytes_written;
            agg.chunk_count += 1;
        }
        aggregates.into_values().collect()
    }

    /// Distinct source URLs currently in flight for each destination path,
    /// for callers that need to cross-reference the rate limiter's
    /// per-URL speed history.
    pub async fn urls_by_destination(&self) -> HashMap<PathBuf, Vec<String>> {
        let entries = self.entries.lock().await;
        let mut urls: HashMap<PathBuf, Vec<String>> = HashMap::new();
        for entry in entries.values() {
            let dest_urls = urls.entry(entry.destination_path.clone()).or_default();
            if !dest_urls.contains(&entry.url) {
                dest_urls.push(entry.url.clone());
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_update_finish_round_trip() {
        let active = ActiveDownloads::new();
        let dest = PathBuf::from("/tmp/a.ts");
        active.start("http://h/a.ts", &dest, 0, Some(1000)).await;
        active.update(&dest, 0, 500).await;

        let aggregates = active.aggregate_by_destination().await;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].bytes_written, 500);

        active.finish(&dest, 0).await;
        assert!(active.aggregate_by_destination().await.is_empty());
    }

    #[tokio::test]
    async fn aggregates_sum_across_chunks_of_same_destination() {
        let active = ActiveDownloads::new();
        let dest = PathBuf::from("/tmp/movie.ts");
        active.start("http://h/movie.ts", &dest, 0, Some(1000)).await;
        active.start("http://h/movie.ts", &dest, 1, Some(1000)).await;
        active.update(&dest, 0, 400).await;
        active.update(&dest, 1, 300).await;

        let aggregates = active.aggregate_by_destination().await;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].bytes_written, 700);
        assert_eq!(aggregates[0].chunk_count, 2);
    }

    #[tokio::test]
    async fn distinct_destinations_stay_separate() {
        let active = ActiveDownloads::new();
        let a = PathBuf::from("/tmp/a.ts");
        let b = PathBuf::from("/tmp/b.ts");
        active.start("http://h/a.ts", &a, 0, None).await;
        active.start("http://h/b.ts", &b, 0, None).await;

        let mut aggregates = active.aggregate_by_destination().await;
        aggregates.sort_by(|x, y| x.destination_path.cmp(&y.destination_path));
        assert_eq!(aggregates.len(), 2);
    }
}
