// file: src/utils/checksum.rs
// version: 1.0.0
// guid: a4e07c93-58d1-4f2b-86a5-e9b03d6c41f8

//! SHA-256 computation and verification

use crate::{FledgeError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Calculate the SHA-256 hash of a file, streaming.
pub async fn calculate_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file's SHA-256 checksum.
///
/// The expected value may be given as "sha256:hash" or a plain hash. An empty
/// expected value skips verification with a warning.
pub async fn verify_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();

    if expected.is_empty() {
        warn!("No checksum provided, skipping verification: {}", path.display());
        return Ok(());
    }

    let expected_hash = expected
        .strip_prefix("sha256:")
        .unwrap_or(expected)
        .trim()
        .to_ascii_lowercase();

    let actual_hash = calculate_sha256(path).await?;

    if actual_hash != expected_hash {
        return Err(FledgeError::ChecksumMismatch {
            expected: expected_hash,
            actual: actual_hash,
        });
    }

    debug!("Checksum verification passed: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONTENT: &str = "fledge test content";

    async fn fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("fixture.bin");
        tokio::fs::write(&path, CONTENT).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_calculate_matches_verify() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir).await;

        let hash = calculate_sha256(&path).await.unwrap();
        assert_eq!(hash.len(), 64);
        verify_checksum(&path, &hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_prefixed_checksum_accepted() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir).await;

        let hash = calculate_sha256(&path).await.unwrap();
        verify_checksum(&path, &format!("sha256:{}", hash))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_expected_skips() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir).await;

        verify_checksum(&path, "").await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_carries_both_digests() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir).await;

        let wrong = "0".repeat(64);
        let err = verify_checksum(&path, &wrong).await.unwrap_err();
        match err {
            FledgeError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, wrong);
                assert_eq!(actual.len(), 64);
                assert_ne!(actual, wrong);
            }
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_uppercase_expected_normalized() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir).await;

        let hash = calculate_sha256(&path).await.unwrap().to_uppercase();
        verify_checksum(&path, &hash).await.unwrap();
    }
}
