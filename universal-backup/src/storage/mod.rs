//! Storage backends: named-blob stores that also carry a manifest sidecar.
//!
//! Each variant implements a handful of primitive object operations. The
//! contract every caller relies on (sidecar handling, retry, download
//! atomicity, listing order) is implemented once, in the provided methods of
//! [`StorageBackend`], so the variants cannot drift apart.

pub mod gcs;
pub mod gdrive;
pub mod google;
pub mod local;
pub mod registry;
pub mod s3;

use crate::config::TransferConfig;
use crate::fs::staging::{commit_part, discard_part, part_path};
use crate::manifest::BackupManifest;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use registry::BackendRegistry;

/// One object as reported by a backend listing. The backend owns it; these
/// values are only used to cross-check the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub storage_class: Option<String>,
}

/// Bounded exponential backoff for `Transfer` errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.max_attempts.max(1);
    let schedule = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_backoff)
        .with_max_interval(policy.max_backoff)
        .with_max_elapsed_time(None)
        .build();

    backoff::future::retry(schedule, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, "{} failed, retrying: {}", what, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

/// Join an optional key prefix and an object name with exactly one `/`.
pub fn object_key(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

/// Inverse of [`object_key`]: `None` when `key` is outside the prefix.
pub fn strip_object_key<'a>(prefix: Option<&str>, key: &'a str) -> Option<&'a str> {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty() && !rest.contains('/')),
        None => Some(key).filter(|k| !k.contains('/')),
    }
}

/// Capability interface implemented by every storage target.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Configured name of this backend instance
    fn name(&self) -> &str;

    /// Backend variant (`s3`, `gcs`, `gdrive`, `local`)
    fn kind(&self) -> &'static str;

    fn retry_policy(&self) -> &RetryPolicy;

    /// Verify the bucket/folder exists and create it if absent. Idempotent.
    async fn ensure_container(&self) -> Result<()>;

    /// Store a local file under `remote_name`, replacing any existing object.
    async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()>;

    /// Store a small in-memory object, replacing any existing object.
    async fn put_bytes(&self, remote_name: &str, data: Vec<u8>) -> Result<()>;

    /// Write the object to `dest`. `NotFound` when it does not exist.
    async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()>;

    /// Read a small object into memory; `None` when it does not exist.
    async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>>;

    /// Every object in the container, sidecars included, in any order.
    async fn list_objects(&self) -> Result<Vec<StoredBlob>>;

    /// Delete one object. `NotFound` when it does not exist.
    async fn delete_object(&self, remote_name: &str) -> Result<()>;

    /// Upload a blob and, when given, its `{remote_name}.manifest.json`
    /// sidecar. Overwrites an existing object of the same name.
    async fn upload(
        &self,
        local: &Path,
        remote_name: &str,
        manifest: Option<&BackupManifest>,
    ) -> Result<()> {
        let policy = self.retry_policy().clone();

        with_retry(&policy, "upload", || self.put_file(local, remote_name)).await?;

        if let Some(manifest) = manifest {
            let sidecar = BackupManifest::sidecar_name(remote_name);
            let json = manifest.to_json_pretty()?.into_bytes();
            with_retry(&policy, "manifest upload", || {
                self.put_bytes(&sidecar, json.clone())
            })
            .await?;
        }

        info!(backend = %self.name(), remote = %remote_name, "Upload complete");
        Ok(())
    }

    /// Download a blob to `local`. The final path only appears once the
    /// whole object has been written; partial output is removed on failure.
    async fn download(&self, remote_name: &str, local: &Path) -> Result<()> {
        let policy = self.retry_policy().clone();
        let part = part_path(local);

        let fetched = with_retry(&policy, "download", || self.fetch_file(remote_name, &part)).await;
        if let Err(e) = fetched {
            discard_part(local).await;
            return Err(e);
        }

        if let Err(e) = commit_part(local).await {
            discard_part(local).await;
            return Err(e.into());
        }

        info!(
            backend = %self.name(),
            remote = %remote_name,
            path = %local.display(),
            "Download complete"
        );
        Ok(())
    }

    /// Blobs newest first by the backend's `last_modified`, sidecars excluded.
    async fn list(&self) -> Result<Vec<StoredBlob>> {
        let policy = self.retry_policy().clone();
        let mut blobs: Vec<StoredBlob> = with_retry(&policy, "list", || self.list_objects())
            .await?
            .into_iter()
            .filter(|b| !BackupManifest::is_sidecar_name(&b.name))
            .collect();

        blobs.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(blobs)
    }

    /// Fetch and parse the sidecar. Absent (not an error) when missing.
    async fn get_manifest(&self, remote_name: &str) -> Result<Option<BackupManifest>> {
        let policy = self.retry_policy().clone();
        let sidecar = BackupManifest::sidecar_name(remote_name);

        match with_retry(&policy, "manifest fetch", || self.fetch_bytes(&sidecar)).await? {
            Some(bytes) => BackupManifest::from_json_slice(&bytes).map(Some),
            None => {
                debug!(backend = %self.name(), remote = %remote_name, "No manifest sidecar");
                Ok(None)
            }
        }
    }

    /// Delete the blob, then best-effort its sidecar.
    async fn delete(&self, remote_name: &str) -> Result<()> {
        let policy = self.retry_policy().clone();
        with_retry(&policy, "delete", || self.delete_object(remote_name)).await?;

        let sidecar = BackupManifest::sidecar_name(remote_name);
        match with_retry(&policy, "manifest delete", || self.delete_object(&sidecar)).await {
            Ok(()) => {}
            Err(BackupError::NotFound(_)) => {
                debug!(backend = %self.name(), remote = %remote_name, "No sidecar to delete")
            }
            Err(e) => warn!(
                backend = %self.name(),
                remote = %remote_name,
                "Failed to delete manifest sidecar: {}",
                e
            ),
        }

        info!(backend = %self.name(), remote = %remote_name, "Deleted");
        Ok(())
    }
}
