//! Local manifest store: the source of truth for backup lineage.
//!
//! One `{filename}.manifest.json` per completed backup, ordered by timestamp.
//! Append-only during normal runs; entries leave only through retention
//! (orphan pruning). Writes are durable (fsync + atomic rename) because a
//! manifest must survive a crash during the upload that follows it.

use super::index::{FileIndex, INDEX_SUFFIX};
use super::{BackupManifest, BackupType, MANIFEST_SUFFIX};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, filename: &str) -> PathBuf {
        self.dir.join(format!("{}{}", filename, MANIFEST_SUFFIX))
    }

    fn index_path(&self, filename: &str) -> PathBuf {
        self.dir.join(format!("{}{}", filename, INDEX_SUFFIX))
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.manifest_path(filename).exists()
    }

    /// Durably persist a new manifest. Filenames are unique: saving over an
    /// existing entry is refused.
    pub fn save(&self, manifest: &BackupManifest) -> Result<PathBuf> {
        let path = self.manifest_path(&manifest.filename);
        if path.exists() {
            return Err(BackupError::InvalidManifest(format!(
                "manifest {} already exists",
                manifest.filename
            )));
        }

        let json = manifest.to_json_pretty()?;
        write_durably(&path, json.as_bytes())?;
        info!(filename = %manifest.filename, path = %path.display(), "Manifest written");
        Ok(path)
    }

    pub fn save_index(&self, filename: &str, index: &FileIndex) -> Result<()> {
        let json = serde_json::to_vec(index)?;
        write_durably(&self.index_path(filename), &json)?;
        debug!(filename = %filename, files = index.total_files, "File index written");
        Ok(())
    }

    pub fn load_index(&self, filename: &str) -> Result<Option<FileIndex>> {
        match fs::read(self.index_path(filename)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, filename: &str) -> Result<Option<BackupManifest>> {
        match fs::read(self.manifest_path(filename)) {
            Ok(bytes) => BackupManifest::from_json_slice(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable manifests, oldest first. Unparseable files are skipped
    /// with a warning rather than failing the whole listing.
    pub fn load_all(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }

            let parsed = fs::read(entry.path())
                .map_err(BackupError::from)
                .and_then(|bytes| BackupManifest::from_json_slice(&bytes));
            match parsed {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(file = %name, "Skipping unreadable manifest: {}", e),
            }
        }

        manifests.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(manifests)
    }

    /// Most recent manifest, optionally restricted to one type.
    pub fn find_last(&self, backup_type: Option<BackupType>) -> Result<Option<BackupManifest>> {
        Ok(self
            .load_all()?
            .into_iter()
            .rev()
            .find(|m| backup_type.map_or(true, |t| m.backup_type == t)))
    }

    /// Remove a manifest and its index. Returns whether a manifest existed.
    pub fn remove(&self, filename: &str) -> Result<bool> {
        let existed = match fs::remove_file(self.manifest_path(filename)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(self.index_path(filename)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(filename = %filename, "Failed to remove file index: {}", e),
        }
        Ok(existed)
    }

    /// Drop every manifest whose blob is not in `live`. A manifest without a
    /// blob is treated as deleted.
    pub fn prune_orphans(&self, live: &HashSet<String>) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for manifest in self.load_all()? {
            if live.contains(&manifest.filename) {
                continue;
            }
            if self.remove(&manifest.filename)? {
                info!(filename = %manifest.filename, "Pruned orphaned manifest");
                pruned.push(manifest.filename);
            }
        }
        Ok(pruned)
    }
}

/// Write via a temp file, fsync, rename, then fsync the directory.
fn write_durably(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BackupError::Configuration(format!("no parent for {}", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}
