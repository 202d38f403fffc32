//! Utility modules shared by the backup and restore engines.

pub mod errors;
pub mod lock;
pub mod logger;
pub mod shutdown;

pub use errors::{BackupError, Result};
