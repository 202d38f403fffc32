//! Run lock guarding the local manifest store.
//!
//! The manifest store has no locking of its own, so every run that mutates it
//! takes an exclusive advisory lock on a well-known file first.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the duration of a run; the lock is released on drop.
pub struct RunLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock without blocking. Fails with `Locked` if another
    /// process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                debug!(path = %path.display(), "Acquired run lock");
                Ok(Self {
                    _flock: flock,
                    path: path.to_path_buf(),
                })
            }
            Err((_, Errno::EAGAIN)) => Err(BackupError::Locked(path.display().to_string())),
            Err((_, errno)) => Err(BackupError::Io(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
