//! Backup → upload → rotate → restore against a local backend, using the
//! native capture and replay tools on a file standing in for the disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use universal_backup::checksum::{sha256_bytes, Verification};
use universal_backup::config::{Config, LocalSettings};
use universal_backup::executor::capture::NativeCapture;
use universal_backup::manifest::{BackupType, ManifestStore};
use universal_backup::notify::LogNotifier;
use universal_backup::orchestrator::{BackupRequest, Orchestrator, EXIT_SUCCESS};
use universal_backup::restore::confirm::CannedConfirmation;
use universal_backup::restore::replay::NativeReplay;
use universal_backup::restore::{RestoreEngine, RestoreMode, RestoreOutcome, LATEST};
use universal_backup::storage::local::LocalBackend;
use universal_backup::storage::{BackendRegistry, RetryPolicy, StorageBackend};
use universal_backup::BackupError;

struct Harness {
    dir: TempDir,
    config: Arc<Config>,
    disk: Vec<u8>,
}

impl Harness {
    fn new(max_count: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let disk: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("disk.img"), &disk).unwrap();

        let config = Config::from_toml_str(&format!(
            r#"
            [general]
            server_id = "db01"

            [paths]
            manifest_dir = "{root}/manifests"
            scratch_dir = "{root}/scratch"

            [source]
            disk = "{root}/disk.img"
            directories = []

            [retention]
            max_count = {max_count}

            [backends.nas]
            kind = "local"
            path = "{root}/nas"
            "#,
            root = dir.path().display(),
            max_count = max_count
        ))
        .unwrap();

        Self {
            dir,
            config: Arc::new(config),
            disk,
        }
    }

    fn remote(&self) -> PathBuf {
        self.dir.path().join("nas")
    }

    fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::new(LocalBackend::new(
            "nas",
            &LocalSettings {
                path: self.remote(),
            },
            RetryPolicy::none(),
        ))
    }

    async fn orchestrator(&self) -> Orchestrator {
        let store = Arc::new(ManifestStore::open(&self.config.paths.manifest_dir).unwrap());
        let registry = BackendRegistry::from_config(&self.config, &[]).await.unwrap();
        Orchestrator::new(
            self.config.clone(),
            store,
            registry,
            Arc::new(NativeCapture::new()),
            Arc::new(LogNotifier),
        )
    }

    fn restore_engine(&self) -> RestoreEngine {
        RestoreEngine::new(
            self.backend(),
            Arc::new(NativeReplay::new()),
            self.dir.path().join("scratch"),
        )
    }

    fn empty_target(&self) -> PathBuf {
        let target = self.dir.path().join("replacement-disk");
        std::fs::write(&target, b"").unwrap();
        target
    }
}

fn set_age(path: &Path, age: Duration) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - age)
        .unwrap();
}

#[tokio::test]
async fn test_full_backup_uploads_and_restores_byte_for_byte() {
    let harness = Harness::new(5);
    let report = harness
        .orchestrator()
        .await
        .run(&BackupRequest::new(BackupType::Full))
        .await
        .unwrap();
    assert_eq!(report.exit_code(), EXIT_SUCCESS);

    let manifest = report.manifest.unwrap();
    assert!(manifest.filename.starts_with("db01_full_"));
    assert!(manifest.filename.ends_with(".img.zst"));

    let backend = harness.backend();
    let listed = backend.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, manifest.filename);

    let stored = std::fs::read(harness.remote().join(&manifest.filename)).unwrap();
    let sidecar = backend.get_manifest(&manifest.filename).await.unwrap().unwrap();
    assert_eq!(sidecar.checksum, sha256_bytes(&stored));
    assert_eq!(sidecar.size_bytes, stored.len() as u64);

    let engine = harness.restore_engine();
    let verified = engine.download_and_verify(LATEST).await.unwrap();
    assert!(matches!(verified.verification(), Verification::Passed { .. }));

    let target = harness.empty_target();
    let outcome = engine
        .restore(
            &verified,
            Some(&target),
            RestoreMode::Interactive,
            &CannedConfirmation::accept(),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RestoreOutcome::Restored {
            target: target.clone(),
            bytes_written: harness.disk.len() as u64,
        }
    );
    assert_eq!(std::fs::read(&target).unwrap(), harness.disk);
}

#[tokio::test]
async fn test_sixth_backup_rotates_out_the_oldest() {
    let harness = Harness::new(5);
    let orchestrator = harness.orchestrator().await;

    let mut names = Vec::new();
    for _ in 0..6 {
        let report = orchestrator
            .run(&BackupRequest::new(BackupType::Full))
            .await
            .unwrap();
        names.push(report.manifest.unwrap().filename);
    }

    let listed = orchestrator.list_backups("nas").await.unwrap();
    assert_eq!(listed.len(), 5);
    assert!(!listed.iter().any(|b| b.name == names[0]));
    assert!(!harness.remote().join(format!("{}.manifest.json", names[0])).exists());

    let local = ManifestStore::open(&harness.config.paths.manifest_dir)
        .unwrap()
        .load_all()
        .unwrap();
    assert_eq!(local.len(), 5);
    assert_eq!(local.last().unwrap().filename, names[5]);
}

#[tokio::test]
async fn test_latest_follows_modification_time() {
    let harness = Harness::new(5);
    std::fs::create_dir_all(harness.remote()).unwrap();
    for (name, days) in [("c-oldest.img.zst", 3), ("a-newest.img.zst", 0), ("b-middle.img.zst", 1)] {
        let path = harness.remote().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        set_age(&path, Duration::from_secs(days * 86_400 + 60));
    }

    let engine = harness.restore_engine();
    assert_eq!(engine.resolve(LATEST).await.unwrap().name, "a-newest.img.zst");
    assert_eq!(
        engine.resolve("b-middle.img.zst").await.unwrap().name,
        "b-middle.img.zst"
    );
    assert!(engine.resolve("b-MIDDLE.img.zst").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_tampered_blob_never_reaches_the_target() {
    let harness = Harness::new(5);
    let report = harness
        .orchestrator()
        .await
        .run(&BackupRequest::new(BackupType::Full))
        .await
        .unwrap();
    let filename = report.manifest.unwrap().filename;

    let blob = harness.remote().join(&filename);
    let mut bytes = std::fs::read(&blob).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&blob, bytes).unwrap();

    let target = harness.empty_target();
    let result = harness.restore_engine().download_and_verify(&filename).await;

    assert!(matches!(result, Err(BackupError::ChecksumMismatch { .. })));
    assert!(std::fs::read(&target).unwrap().is_empty());
}

#[tokio::test]
async fn test_unattended_restore_is_refused() {
    let harness = Harness::new(5);
    harness
        .orchestrator()
        .await
        .run(&BackupRequest::new(BackupType::Full))
        .await
        .unwrap();

    let engine = harness.restore_engine();
    let verified = engine.download_and_verify(LATEST).await.unwrap();
    let target = harness.empty_target();

    let result = engine
        .restore(
            &verified,
            Some(&target),
            RestoreMode::NonInteractive,
            &CannedConfirmation::accept(),
        )
        .await;
    assert!(matches!(result, Err(BackupError::RestoreRefused(_))));

    let declined = engine
        .restore(
            &verified,
            Some(&target),
            RestoreMode::Interactive,
            &CannedConfirmation::decline(),
        )
        .await;
    assert!(matches!(declined, Err(BackupError::RestoreRefused(_))));
    assert!(std::fs::read(&target).unwrap().is_empty());
}
