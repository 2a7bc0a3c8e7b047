use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// On-disk resume checkpoint for one destination path.
///
/// Mirrors the JSON schema from spec.md §6 exactly so that a crashed run's
/// state files remain loadable without a migration step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub filepath: String,
    pub url: String,
    /// chunk index -> bytes already written for that chunk.
    pub downloaded_chunks: HashMap<usize, u64>,
    pub total_size: u64,
    /// `(start, end)` per chunk, in plan order. `end` is `None` only for an
    /// unbounded final/sole chunk. True byte ranges, not positional indices
    /// (spec.md §9 calls out the source's bug of recording the latter).
    pub chunk_ranges: Vec<(u64, Option<u64>)>,
    pub timestamp: f64,
}

impl StateRecord {
    pub fn new(
        destination_path: &Path,
        source_url: &str,
        total_size: u64,
        chunk_ranges: Vec<(u64, Option<u64>)>,
        downloaded_chunks: HashMap<usize, u64>,
    ) -> Self {
        Self {
            filepath: destination_path.to_string_lossy().into_owned(),
            url: source_url.to_string(),
            downloaded_chunks,
            total_size,
            chunk_ranges,
            timestamp: now_secs(),
        }
    }
}

pub(crate) fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Encodes a destination path into a filesystem-safe state-file stem by
/// replacing `/`, `\` and `:` with `_`.
fn encode_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// File-backed key-value store for [`StateRecord`]s, one JSON file per
/// destination path under `dir`.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn state_path(&self, destination_path: &Path) -> PathBuf {
        self.dir.join(format!("{}.state", encode_path(destination_path)))
    }

    /// Serializes `record` and writes it via a temp-file-then-rename so a
    /// crash mid-write cannot corrupt a previously successful record.
    pub fn save(&self, record: &StateRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let final_path = self.state_path(Path::new(&record.filepath));
        let tmp_path = final_path.with_extension("state.tmp");
        let body = serde_json::to_vec(record)?;
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Returns `None` on a missing file or a parse failure — a corrupted
    /// state file is treated as "start fresh", never as an error.
    pub fn load(&self, destination_path: &Path) -> Option<StateRecord> {
        let path = self.state_path(destination_path);
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "state file failed to parse, treating as absent");
                None
            }
        }
    }

    /// Removes the state file if present; a silent no-op otherwise.
    pub fn clear(&self, destination_path: &Path) {
        let path = self.state_path(destination_path);
        let _ = fs::remove_file(path);
    }

    /// Enumerates every state file in the directory, skipping unparseable ones.
    pub fn list_incomplete(&self) -> Vec<StateRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("state") {
                continue;
            }
            if let Ok(bytes) = fs::read(&path) {
                if let Ok(record) = serde_json::from_slice::<StateRecord>(&bytes) {
                    records.push(record);
                }
            }
        }
        records
    }
}
