//! One backup run across every selected backend.
//!
//! create -> upload (+ cross-check) per backend -> rotate -> prune -> notify
//!
//! Steps run strictly in sequence under the run lock. A backend that fails
//! does not stop the others; only backends that received the new backup are
//! rotated.

use crate::config::Config;
use crate::executor::capture::CaptureTool;
use crate::executor::{BackupEngine, BackupPlan, CreatedBackup, EngineSettings};
use crate::manifest::{BackupManifest, BackupType, ManifestStore};
use crate::notify::{send_best_effort, Notifier};
use crate::retention::{RetentionPolicy, RotationReport};
use crate::storage::{with_retry, BackendRegistry, StorageBackend, StoredBlob};
use crate::transfer::format_bytes;
use crate::utils::errors::Result;
use crate::utils::lock::RunLock;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status of a run whose every step succeeded
pub const EXIT_SUCCESS: i32 = 0;
/// Nothing useful happened
pub const EXIT_FAILURE: i32 = 1;
/// Some backends succeeded, or an integrity warning was raised
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    /// Resolve the plan only; capture, upload and rotate nothing
    pub dry_run: bool,
    pub no_upload: bool,
    pub no_rotation: bool,
    pub keep_local: bool,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            dry_run: false,
            no_upload: false,
            no_rotation: false,
            keep_local: false,
        }
    }
}

/// What happened on one backend
#[derive(Debug, Default)]
pub struct BackendOutcome {
    pub backend: String,
    pub uploaded: bool,
    pub error: Option<String>,
    /// Listing or sidecar disagreed with the manifest after upload
    pub integrity_warning: Option<String>,
    pub rotation: Option<RotationReport>,
    pub rotation_error: Option<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub plan: BackupPlan,
    pub manifest: Option<BackupManifest>,
    pub dry_run: bool,
    pub uploads_skipped: bool,
    pub outcomes: Vec<BackendOutcome>,
    pub pruned: Vec<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &BackendOutcome> {
        self.outcomes.iter().filter(|o| o.uploaded)
    }

    /// Logical AND of the backend results; partial success is its own code.
    pub fn exit_code(&self) -> i32 {
        if self.dry_run || self.uploads_skipped {
            return EXIT_SUCCESS;
        }
        let ok = self.succeeded().count();
        let clean = self
            .outcomes
            .iter()
            .all(|o| o.uploaded && o.integrity_warning.is_none());

        if ok == 0 {
            EXIT_FAILURE
        } else if clean {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }

    pub fn subject(&self, host: &str) -> String {
        let status = match self.exit_code() {
            EXIT_SUCCESS => "succeeded",
            EXIT_PARTIAL => "partially succeeded",
            _ => "failed",
        };
        format!("[{}] {} backup {}", host, self.plan.effective, status)
    }

    pub fn summary(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "Requested: {}", self.plan.requested);
        let _ = writeln!(text, "Created:   {}", self.plan.effective);
        if self.plan.fell_back() {
            let _ = writeln!(text, "  (no full backup existed to diff against)");
        }
        if let Some(base) = &self.plan.base {
            let _ = writeln!(text, "Base:      {}", base.filename);
        }
        let _ = writeln!(text, "Source:    {}", self.plan.source);

        match &self.manifest {
            Some(m) => {
                let _ = writeln!(text, "File:      {}", m.filename);
                let _ = writeln!(text, "Size:      {}", format_bytes(m.size_bytes));
                let _ = writeln!(text, "SHA-256:   {}", m.checksum);
            }
            None if self.dry_run => {
                let _ = writeln!(text, "Dry run: nothing was captured");
            }
            None => {}
        }
        if self.uploads_skipped {
            let _ = writeln!(text, "Upload skipped; the artifact was kept locally");
        }

        for outcome in &self.outcomes {
            let status = match (&outcome.error, outcome.uploaded) {
                (Some(e), _) => format!("FAILED: {}", e),
                (None, true) => "uploaded".to_string(),
                (None, false) => "skipped".to_string(),
            };
            let _ = writeln!(text, "- {}: {}", outcome.backend, status);
            if let Some(w) = &outcome.integrity_warning {
                let _ = writeln!(text, "    INTEGRITY WARNING: {}", w);
            }
            if let Some(r) = &outcome.rotation {
                let _ = writeln!(
                    text,
                    "    rotation: {} deleted, {} kept, {} failed",
                    r.deleted.len(),
                    r.kept.len(),
                    r.failures.len()
                );
            }
            if let Some(e) = &outcome.rotation_error {
                let _ = writeln!(text, "    rotation failed: {}", e);
            }
        }
        if !self.pruned.is_empty() {
            let _ = writeln!(text, "Pruned {} orphaned manifest(s)", self.pruned.len());
        }
        text
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<ManifestStore>,
    registry: BackendRegistry,
    capture: Arc<dyn CaptureTool>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ManifestStore>,
        registry: BackendRegistry,
        capture: Arc<dyn CaptureTool>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            capture,
            notifier,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Blobs on one backend, newest first.
    pub async fn list_backups(&self, backend: &str) -> Result<Vec<StoredBlob>> {
        self.registry.get(backend)?.list().await
    }

    pub async fn run(&self, request: &BackupRequest) -> Result<RunReport> {
        let _lock = RunLock::acquire(&self.config.paths.lock_file())?;
        let host = self.config.general.server_id.clone();

        let mut engine = BackupEngine::with_cancel(
            EngineSettings::from_config(&self.config),
            self.store.clone(),
            self.capture.clone(),
            self.cancel.clone(),
        );

        if request.dry_run {
            let plan = engine.plan(request.backup_type)?;
            let report = RunReport {
                plan,
                manifest: None,
                dry_run: true,
                uploads_skipped: true,
                outcomes: Vec::new(),
                pruned: Vec::new(),
            };
            info!(backends = ?self.registry.names(), "Dry run\n{}", report.summary());
            return Ok(report);
        }

        let created = match engine.create(request.backup_type).await {
            Ok(created) => created,
            Err(e) => {
                send_best_effort(
                    self.notifier.as_ref(),
                    &format!("[{}] {} backup failed", host, request.backup_type),
                    &format!("The backup could not be created: {}", e),
                )
                .await;
                return Err(e);
            }
        };

        let report = self.ship(created, request).await;

        if report.exit_code() == EXIT_SUCCESS {
            info!("Backup run complete\n{}", report.summary());
        } else {
            error!("Backup run finished with problems\n{}", report.summary());
        }
        send_best_effort(self.notifier.as_ref(), &report.subject(&host), &report.summary()).await;

        Ok(report)
    }

    /// Upload, rotate and prune. Consumes the created backup so the staging
    /// area is cleaned up (or kept) when this returns.
    async fn ship(&self, created: CreatedBackup, request: &BackupRequest) -> RunReport {
        let CreatedBackup {
            manifest,
            artifact,
            plan,
            mut staging,
            ..
        } = created;

        staging.keep(request.keep_local || request.no_upload);

        let mut report = RunReport {
            plan,
            manifest: Some(manifest.clone()),
            dry_run: false,
            uploads_skipped: request.no_upload,
            outcomes: Vec::new(),
            pruned: Vec::new(),
        };

        if request.no_upload {
            info!(path = %artifact.display(), "Upload skipped");
            return report;
        }

        for backend in self.registry.iter() {
            let mut outcome = BackendOutcome {
                backend: backend.name().to_string(),
                ..BackendOutcome::default()
            };

            if self.cancel.is_cancelled() {
                outcome.error = Some("cancelled".to_string());
                report.outcomes.push(outcome);
                continue;
            }

            match self.upload_one(backend.as_ref(), &artifact, &manifest).await {
                Ok(()) => {
                    outcome.uploaded = true;
                    if self.config.transfer.verify_after_upload {
                        outcome.integrity_warning =
                            cross_check(backend.as_ref(), &manifest).await;
                    }
                }
                Err(e) => {
                    error!(backend = %backend.name(), "Upload failed: {}", e);
                    outcome.error = Some(e.to_string());
                }
            }
            report.outcomes.push(outcome);
        }

        for (name, reason) in self.registry.unavailable() {
            report.outcomes.push(BackendOutcome {
                backend: name.to_string(),
                error: Some(reason.to_string()),
                ..BackendOutcome::default()
            });
        }

        let rotate = !request.no_rotation && !self.cancel.is_cancelled();
        if rotate {
            let policy = RetentionPolicy::from_config(&self.config.retention);
            for outcome in report.outcomes.iter_mut().filter(|o| o.uploaded) {
                let Ok(backend) = self.registry.get(&outcome.backend) else {
                    continue;
                };
                match policy.rotate(backend.as_ref()).await {
                    Ok(rotation) => outcome.rotation = Some(rotation),
                    Err(e) => {
                        warn!(backend = %outcome.backend, "Rotation failed: {}", e);
                        outcome.rotation_error = Some(e.to_string());
                    }
                }
            }

            if report.succeeded().count() > 0 {
                report.pruned = self.prune_orphans(&manifest).await;
            }
        }

        report
    }

    async fn upload_one(
        &self,
        backend: &dyn StorageBackend,
        artifact: &std::path::Path,
        manifest: &BackupManifest,
    ) -> Result<()> {
        with_retry(backend.retry_policy(), "ensure container", || {
            backend.ensure_container()
        })
        .await?;
        info!(
            backend = %backend.name(),
            filename = %manifest.filename,
            size = %format_bytes(manifest.size_bytes),
            "Uploading"
        );
        backend
            .upload(artifact, &manifest.filename, Some(manifest))
            .await
    }

    /// Remove local manifests whose blob is on no backend. Only runs when
    /// every configured backend is loaded and every listing succeeded.
    async fn prune_orphans(&self, current: &BackupManifest) -> Vec<String> {
        if self.registry.len() != self.config.backends.len() {
            info!("Skipping manifest pruning: not every configured backend is loaded");
            return Vec::new();
        }

        let mut live: HashSet<String> = HashSet::new();
        live.insert(current.filename.clone());

        for backend in self.registry.iter() {
            match backend.list().await {
                Ok(blobs) => live.extend(blobs.into_iter().map(|b| b.name)),
                Err(e) => {
                    warn!(
                        backend = %backend.name(),
                        "Skipping manifest pruning, listing failed: {}",
                        e
                    );
                    return Vec::new();
                }
            }
        }

        match self.store.prune_orphans(&live) {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Manifest pruning failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Compare what the backend now reports against the manifest. Returns a
/// description of the first disagreement, if any.
async fn cross_check(backend: &dyn StorageBackend, manifest: &BackupManifest) -> Option<String> {
    let problem = match backend.list().await {
        Ok(blobs) => match blobs.iter().find(|b| b.name == manifest.filename) {
            None => Some("uploaded blob is missing from the listing".to_string()),
            Some(blob) if blob.size != manifest.size_bytes => Some(format!(
                "listed size {} differs from manifest size {}",
                blob.size, manifest.size_bytes
            )),
            Some(_) => None,
        },
        Err(e) => Some(format!("listing failed: {}", e)),
    };
    if let Some(problem) = problem {
        warn!(backend = %backend.name(), filename = %manifest.filename, "Integrity warning: {}", problem);
        return Some(problem);
    }

    let problem = match backend.get_manifest(&manifest.filename).await {
        Ok(Some(stored)) if stored.checksum == manifest.checksum => None,
        Ok(Some(stored)) => Some(format!(
            "sidecar checksum {} differs from {}",
            stored.checksum, manifest.checksum
        )),
        Ok(None) => Some("manifest sidecar is missing".to_string()),
        Err(e) => Some(format!("sidecar fetch failed: {}", e)),
    };
    match &problem {
        Some(p) => warn!(backend = %backend.name(), filename = %manifest.filename, "Integrity warning: {}", p),
        None => info!(backend = %backend.name(), filename = %manifest.filename, "Upload cross-check passed"),
    }
    problem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::capture::CaptureRequest;
    use crate::config::LocalSettings;
    use crate::notify::LogNotifier;
    use crate::storage::local::LocalBackend;
    use crate::storage::RetryPolicy;
    use crate::utils::errors::BackupError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Local directory whose first container check fails with a transient error
    struct FlakyContainer {
        inner: LocalBackend,
        retry: RetryPolicy,
        checks: AtomicU32,
    }

    #[async_trait]
    impl StorageBackend for FlakyContainer {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn kind(&self) -> &'static str {
            "flaky"
        }
        fn retry_policy(&self) -> &RetryPolicy {
            &self.retry
        }
        async fn ensure_container(&self) -> Result<()> {
            if self.checks.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BackupError::Transfer("connection reset".into()));
            }
            self.inner.ensure_container().await
        }
        async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()> {
            self.inner.put_file(local, remote_name).await
        }
        async fn put_bytes(&self, remote_name: &str, data: Vec<u8>) -> Result<()> {
            self.inner.put_bytes(remote_name, data).await
        }
        async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()> {
            self.inner.fetch_file(remote_name, dest).await
        }
        async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>> {
            self.inner.fetch_bytes(remote_name).await
        }
        async fn list_objects(&self) -> Result<Vec<StoredBlob>> {
            self.inner.list_objects().await
        }
        async fn delete_object(&self, remote_name: &str) -> Result<()> {
            self.inner.delete_object(remote_name).await
        }
    }

    struct FixedCapture;

    #[async_trait]
    impl CaptureTool for FixedCapture {
        async fn capture(&self, request: &CaptureRequest, _: &CancellationToken) -> Result<u64> {
            tokio::fs::write(&request.output, b"captured").await?;
            Ok(8)
        }
    }

    fn config(root: &Path, backends: &str) -> Config {
        let source = root.join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("f"), b"file").unwrap();
        Config::from_toml_str(&format!(
            r#"
            [general]
            server_id = "web01"

            [paths]
            manifest_dir = "{root}/manifests"
            scratch_dir = "{root}/scratch"

            [source]
            directories = ["{root}/src"]

            [retention]
            max_count = 2

            {backends}
            "#,
            root = root.display(),
            backends = backends
        ))
        .unwrap()
    }

    async fn orchestrator(config: Config) -> Orchestrator {
        let config = Arc::new(config);
        let store = Arc::new(ManifestStore::open(&config.paths.manifest_dir).unwrap());
        let registry = BackendRegistry::from_config(&config, &[]).await.unwrap();
        Orchestrator::new(config, store, registry, Arc::new(FixedCapture), Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn test_run_uploads_everywhere_and_cleans_staging() {
        let dir = TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &format!(
                "[backends.a]\nkind = \"local\"\npath = \"{0}/a\"\n[backends.b]\nkind = \"local\"\npath = \"{0}/b\"\n",
                dir.path().display()
            ),
        );
        let orchestrator = orchestrator(config).await;

        let report = orchestrator
            .run(&BackupRequest::new(BackupType::Full))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(report.succeeded().count(), 2);
        assert!(report.outcomes.iter().all(|o| o.integrity_warning.is_none()));

        let filename = report.manifest.as_ref().unwrap().filename.clone();
        assert!(dir.path().join("a").join(&filename).exists());
        assert!(dir
            .path()
            .join("b")
            .join(BackupManifest::sidecar_name(&filename))
            .exists());
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_one_failing_backend_is_partial() {
        let dir = TempDir::new().unwrap();
        // a regular file where the backup directory should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let config = config(
            dir.path(),
            &format!(
                "[backends.good]\nkind = \"local\"\npath = \"{0}/good\"\n[backends.bad]\nkind = \"local\"\npath = \"{1}/sub\"\n",
                dir.path().display(),
                blocker.display()
            ),
        );
        let orchestrator = orchestrator(config).await;

        let report = orchestrator
            .run(&BackupRequest::new(BackupType::Full))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_PARTIAL);
        let bad = report.outcomes.iter().find(|o| o.backend == "bad").unwrap();
        assert!(!bad.uploaded);
        assert!(bad.error.is_some());
        assert!(bad.rotation.is_none());
        let good = report.outcomes.iter().find(|o| o.backend == "good").unwrap();
        assert!(good.uploaded);
        assert!(good.rotation.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &format!("[backends.a]\nkind = \"local\"\npath = \"{}/a\"\n", dir.path().display()),
        );
        let manifests = config.paths.manifest_dir.clone();
        let orchestrator = orchestrator(config).await;

        let mut request = BackupRequest::new(BackupType::Differential);
        request.dry_run = true;
        let report = orchestrator.run(&request).await.unwrap();

        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert!(report.plan.fell_back());
        assert!(report.manifest.is_none());
        assert!(!dir.path().join("a").exists());
        assert!(ManifestStore::open(&manifests).unwrap().load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_and_pruning_follow_retention() {
        let dir = TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &format!("[backends.a]\nkind = \"local\"\npath = \"{}/a\"\n", dir.path().display()),
        );
        let manifests = config.paths.manifest_dir.clone();
        let orchestrator = orchestrator(config).await;

        for _ in 0..3 {
            orchestrator
                .run(&BackupRequest::new(BackupType::Full))
                .await
                .unwrap();
        }

        let listed = orchestrator.list_backups("a").await.unwrap();
        assert_eq!(listed.len(), 2);
        let local = ManifestStore::open(&manifests).unwrap().load_all().unwrap();
        assert_eq!(local.len(), 2);
        for manifest in local {
            assert!(listed.iter().any(|b| b.name == manifest.filename));
        }
    }

    #[tokio::test]
    async fn test_no_upload_keeps_artifact() {
        let dir = TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &format!("[backends.a]\nkind = \"local\"\npath = \"{}/a\"\n", dir.path().display()),
        );
        let orchestrator = orchestrator(config).await;

        let mut request = BackupRequest::new(BackupType::Full);
        request.no_upload = true;
        let report = orchestrator.run(&request).await.unwrap();

        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert!(report.outcomes.is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_cloud_backend_still_ships_to_local() {
        let dir = TempDir::new().unwrap();
        let config = config(
            dir.path(),
            &format!(
                "[backends.nas]\nkind = \"local\"\npath = \"{0}/nas\"\n[backends.cloud]\nkind = \"gcs\"\ncredentials_file = \"{0}/missing-key.json\"\n",
                dir.path().display()
            ),
        );
        let orchestrator = orchestrator(config).await;

        let report = orchestrator
            .run(&BackupRequest::new(BackupType::Full))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_PARTIAL);
        let nas = report.outcomes.iter().find(|o| o.backend == "nas").unwrap();
        assert!(nas.uploaded);
        let cloud = report.outcomes.iter().find(|o| o.backend == "cloud").unwrap();
        assert!(!cloud.uploaded);
        assert!(cloud.error.is_some());
        assert!(report.summary().contains("- cloud: FAILED"));

        let filename = report.manifest.unwrap().filename;
        assert!(dir.path().join("nas").join(filename).exists());
    }

    #[tokio::test]
    async fn test_transient_container_error_is_retried() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(config(
            dir.path(),
            &format!("[backends.nas]\nkind = \"local\"\npath = \"{}/nas\"\n", dir.path().display()),
        ));
        let backend = Arc::new(FlakyContainer {
            inner: LocalBackend::new(
                "nas",
                &LocalSettings {
                    path: dir.path().join("nas"),
                },
                RetryPolicy::none(),
            ),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            checks: AtomicU32::new(0),
        });
        let mut registry = BackendRegistry::new();
        registry.insert(backend.clone());
        let store = Arc::new(ManifestStore::open(&config.paths.manifest_dir).unwrap());
        let orchestrator = Orchestrator::new(
            config,
            store,
            registry,
            Arc::new(FixedCapture),
            Arc::new(LogNotifier),
        );

        let report = orchestrator
            .run(&BackupRequest::new(BackupType::Full))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(backend.checks.load(Ordering::SeqCst), 2);
    }
}
