//! Directory-backed storage (NAS mount, USB disk, or a test fixture).

use super::{RetryPolicy, StorageBackend, StoredBlob};
use crate::config::LocalSettings;
use crate::transfer::{logging_callback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

pub struct LocalBackend {
    name: String,
    root: PathBuf,
    retry: RetryPolicy,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, settings: &LocalSettings, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            root: settings.path.clone(),
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, remote_name: &str) -> Result<PathBuf> {
        if remote_name.is_empty()
            || remote_name.contains('/')
            || remote_name.starts_with('.')
        {
            return Err(BackupError::Configuration(format!(
                "invalid object name '{}'",
                remote_name
            )));
        }
        Ok(self.root.join(remote_name))
    }

    /// Hidden in-progress name; listings skip dot files.
    fn temp_path(&self, remote_name: &str) -> PathBuf {
        self.root.join(format!(".{}.part", remote_name))
    }

    async fn copy_with_progress(&self, from: &Path, to: &Path, label: &str) -> Result<u64> {
        let source = tokio::fs::File::open(from).await.map_err(|e| not_found_or(e, from))?;
        let total = source.metadata().await?.len();

        let mut stream = ProgressStream::new(ReaderStream::new(source), logging_callback(label, total));
        let mut dest = tokio::fs::File::create(to).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.sync_all().await?;

        Ok(written)
    }
}

fn not_found_or(e: std::io::Error, path: &Path) -> BackupError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackupError::NotFound(path.display().to_string())
    } else {
        BackupError::Io(e)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn ensure_container(&self) -> Result<()> {
        if tokio::fs::metadata(&self.root).await.is_ok_and(|m| m.is_dir()) {
            debug!(backend = %self.name, path = %self.root.display(), "Directory exists");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            BackupError::Provisioning(format!("cannot create {}: {}", self.root.display(), e))
        })?;
        info!(backend = %self.name, path = %self.root.display(), "Created backup directory");
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()> {
        let dest = self.object_path(remote_name)?;
        let temp = self.temp_path(remote_name);

        let copied = self
            .copy_with_progress(local, &temp, &format!("{} upload", self.name))
            .await;
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }

        tokio::fs::rename(&temp, &dest).await?;
        Ok(())
    }

    async fn put_bytes(&self, remote_name: &str, data: Vec<u8>) -> Result<()> {
        let dest = self.object_path(remote_name)?;
        let temp = self.temp_path(remote_name);
        tokio::fs::write(&temp, &data).await?;
        tokio::fs::rename(&temp, &dest).await?;
        Ok(())
    }

    async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let source = self.object_path(remote_name)?;
        self.copy_with_progress(&source, dest, &format!("{} download", self.name))
            .await?;
        Ok(())
    }

    async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.object_path(remote_name)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(&self) -> Result<Vec<StoredBlob>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| not_found_or(e, &self.root))?;
        let mut blobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            blobs.push(StoredBlob {
                name,
                size: metadata.len(),
                last_modified: DateTime::<Utc>::from(metadata.modified()?),
                storage_class: None,
            });
        }

        Ok(blobs)
    }

    async fn delete_object(&self, remote_name: &str) -> Result<()> {
        let path = self.object_path(remote_name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(e, &path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumVerifier;
    use crate::manifest::{BackupManifest, BackupType};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn backend(dir: &Path) -> LocalBackend {
        let settings = LocalSettings {
            path: dir.join("store"),
        };
        LocalBackend::new("test", &settings, RetryPolicy::none())
    }

    fn manifest_for(filename: &str, checksum: &str) -> BackupManifest {
        BackupManifest {
            backup_type: BackupType::Full,
            timestamp: Utc::now(),
            filename: filename.to_string(),
            source: None,
            size_bytes: 11,
            checksum: checksum.to_string(),
            compression: None,
            base_manifest: None,
            host: Some("host".into()),
        }
    }

    fn set_mtime(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_ensure_container_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());

        backend.ensure_container().await.unwrap();
        backend.ensure_container().await.unwrap();
        assert!(backend.root().is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("artifact.img.zst");
        std::fs::write(&source, b"hello world").unwrap();
        let verifier = ChecksumVerifier::new();
        let checksum = verifier.sha256_file(&source).await.unwrap();
        let manifest = manifest_for("artifact.img.zst", &checksum);

        backend
            .upload(&source, "artifact.img.zst", Some(&manifest))
            .await
            .unwrap();

        let restored = dir.path().join("restored.img.zst");
        backend.download("artifact.img.zst", &restored).await.unwrap();
        assert_eq!(verifier.verify(&restored, &checksum).await.unwrap(), checksum);

        let fetched = backend.get_manifest("artifact.img.zst").await.unwrap();
        assert_eq!(fetched, Some(manifest));
    }

    #[tokio::test]
    async fn test_upload_overwrites_existing_object() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("a");
        std::fs::write(&source, b"first version").unwrap();
        backend.upload(&source, "a.tar.zst", None).await.unwrap();
        std::fs::write(&source, b"second").unwrap();
        backend.upload(&source, "a.tar.zst", None).await.unwrap();

        assert_eq!(
            std::fs::read(backend.root().join("a.tar.zst")).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_list_is_newest_first_without_sidecars() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("src");
        std::fs::write(&source, b"data").unwrap();
        for name in ["old.img.zst", "new.img.zst", "mid.img.zst"] {
            let manifest = manifest_for(name, &"a".repeat(64));
            backend.upload(&source, name, Some(&manifest)).await.unwrap();
        }
        set_mtime(&backend.root().join("old.img.zst"), Duration::from_secs(3 * 86400));
        set_mtime(&backend.root().join("mid.img.zst"), Duration::from_secs(86400));

        let names: Vec<_> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["new.img.zst", "mid.img.zst", "old.img.zst"]);
    }

    #[tokio::test]
    async fn test_missing_sidecar_is_absent_not_error() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("src");
        std::fs::write(&source, b"data").unwrap();
        backend.upload(&source, "legacy.img.gz", None).await.unwrap();

        assert_eq!(backend.get_manifest("legacy.img.gz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_download_missing_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let dest = dir.path().join("out.img.zst");
        let err = backend.download("missing.img.zst", &dest).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(!dest.exists());
        assert!(!crate::fs::staging::part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("src");
        std::fs::write(&source, b"data").unwrap();
        let manifest = manifest_for("x.img.zst", &"b".repeat(64));
        backend.upload(&source, "x.img.zst", Some(&manifest)).await.unwrap();

        backend.delete("x.img.zst").await.unwrap();
        assert!(backend.list_objects().await.unwrap().is_empty());
        assert!(backend.delete("x.img.zst").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_without_sidecar_succeeds() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        backend.ensure_container().await.unwrap();

        let source = dir.path().join("src");
        std::fs::write(&source, b"data").unwrap();
        backend.upload(&source, "bare.img.zst", None).await.unwrap();

        backend.delete("bare.img.zst").await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
    }
}
