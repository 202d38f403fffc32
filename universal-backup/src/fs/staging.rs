//! Scratch space for captured and downloaded artifacts.
//!
//! Each run gets its own staging directory under the configured scratch dir.
//! Files are written under a `.part` name and renamed into place only once
//! complete, so a final-named file in staging is always whole. The directory
//! is removed when the guard drops unless the caller asked to keep it.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

const PART_SUFFIX: &str = ".part";

pub struct StagingArea {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl StagingArea {
    /// Create a fresh staging directory under `scratch_dir`.
    pub fn create(scratch_dir: &Path, label: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", label))
            .tempdir_in(scratch_dir)?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
            keep: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final location of a file in staging
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Keep the staging directory (and its artifact) after the run.
    pub fn keep(&mut self, keep: bool) {
        self.keep = keep;
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else { return };
        if self.keep {
            let kept = dir.keep();
            info!(path = %kept.display(), "Keeping local copy");
        } else if let Err(e) = dir.close() {
            warn!(path = %self.path.display(), "Failed to clean up staging: {}", e);
        }
    }
}

/// Temporary sibling used while `path` is being written
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Move a completed `.part` file to its final name.
pub async fn commit_part(path: &Path) -> std::io::Result<()> {
    tokio::fs::rename(part_path(path), path).await
}

/// Remove a partial file, ignoring absence.
pub async fn discard_part(path: &Path) {
    let part = part_path(path);
    match tokio::fs::remove_file(&part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %part.display(), "Failed to remove partial file: {}", e),
    }
}
