use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::EngineError;

const READ_BUFFER: usize = 8192;

/// Verifies `path`'s SHA-256 digest against `expected_hex`.
///
/// Off by default everywhere in this crate (spec.md §9): no operation
/// calls this on the default path. Exposed for callers who want an
/// explicit, opt-in integrity check after a merge completes.
pub async fn verify_checksum(path: &Path, expected_hex: &str) -> Result<bool, EngineError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = format!("{:x}", hasher.finalize());
    Ok(digest == expected_hex.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verify_checksum_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        // sha256("hello world")
        let expected = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde";
        assert!(verify_checksum(&path, expected).await.unwrap());
    }

    #[tokio::test]
    async fn verify_checksum_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        assert!(!verify_checksum(&path, &"0".repeat(64)).await.unwrap());
    }
}
