//! Universal Backup Library
//!
//! Full, incremental and differential backups of a disk or directory set,
//! shipped to S3, GCS, Google Drive or local storage with a manifest sidecar,
//! rotated per backend and restored only after checksum verification.

pub mod checksum;
pub mod config;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod restore;
pub mod retention;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
