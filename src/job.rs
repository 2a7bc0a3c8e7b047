use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An immutable unit of work: fetch `source_url` into `destination_path`.
///
/// Produced by an external collaborator (e.g. a playlist parser) and
/// submitted to [`crate::scheduler::BatchScheduler`] or
/// [`crate::file_downloader::FileDownloader`] as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub source_url: String,
    pub destination_path: PathBuf,
}

impl Job {
    pub fn new(source_url: impl Into<String>, destination_path: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination_path: destination_path.into(),
        }
    }
}
