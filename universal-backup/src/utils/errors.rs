//! Error taxonomy for backup, transfer and restore operations.
//!
//! Vendor errors (AWS SDK, HTTP) are translated into these variants at the
//! storage backend boundary; callers never match on SDK types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    #[error("Checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Restore refused: {0}")]
    RestoreRefused(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Another run holds the lock: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Only transfer failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Transfer(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(e: config::ConfigError) -> Self {
        BackupError::Configuration(e.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(404) {
            BackupError::NotFound(e.to_string())
        } else {
            BackupError::Transfer(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
