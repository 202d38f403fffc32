//! Content-integrity digests for backup artifacts.
//!
//! Artifacts are disk-image sized, so hashing always streams the file in
//! fixed-size blocks and never holds more than one block in memory.

use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Read size for streaming digests
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// Outcome of checking an artifact against its manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Digest matched the manifest
    Passed { checksum: String },
    /// No manifest (or no digest) to compare against
    Skipped { reason: String },
}

impl Verification {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verification::Passed { .. })
    }
}

/// Computes and validates SHA-256 digests of files.
#[derive(Debug, Clone, Default)]
pub struct ChecksumVerifier {
    cancel: Option<CancellationToken>,
}

impl ChecksumVerifier {
    pub fn new() -> Self {
        Self { cancel: None }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// Hex-encoded SHA-256 of the file at `path`.
    pub async fn sha256_file(&self, path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BLOCK_SIZE];

        loop {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(BackupError::Cancelled);
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Fail with `ChecksumMismatch` unless the file hashes to `expected`.
    pub async fn verify(&self, path: &Path, expected: &str) -> Result<String> {
        let actual = self.sha256_file(path).await?;

        if actual.eq_ignore_ascii_case(expected) {
            info!(path = %path.display(), "Checksum verified");
            Ok(actual)
        } else {
            error!(
                path = %path.display(),
                expected = %expected,
                actual = %actual,
                "Checksum mismatch"
            );
            Err(BackupError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// True for a 64-character hex string.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
