use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Explicit engine configuration, replacing the dynamic dict-typed config
/// of the Python original with a fixed, documented set of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of Jobs the [`crate::scheduler::BatchScheduler`] runs concurrently.
    pub max_concurrent_files: usize,
    /// Maximum number of byte-range chunks per file.
    pub max_chunks_per_file: usize,
    /// Global throughput cap in bytes/sec, or `None` for unlimited.
    pub max_speed_limit_bytes_per_second: Option<u64>,
    /// Whether interrupted downloads persist resume state and may continue later.
    pub enable_resume: bool,
    /// Whether files are split into parallel range requests at all.
    pub enable_chunked: bool,
    /// Retry budget for both chunk-level and job-level failures.
    pub retry_count: u32,
    /// Directory holding one `<encoded-path>.state` JSON file per active download.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 3,
            max_chunks_per_file: 4,
            max_speed_limit_bytes_per_second: None,
            enable_resume: true,
            enable_chunked: true,
            retry_count: 3,
            state_dir: PathBuf::from(".download_state"),
        }
    }
}
