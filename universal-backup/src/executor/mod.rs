//! Backup engine - creates full, incremental and differential backups.
//!
//! One invocation walks a fixed state machine:
//!
//! `Idle -> Sizing -> Capturing -> Hashing -> ManifestWritten -> Done`
//!
//! with any failure ending in `Failed`. The manifest is the last thing
//! written: a run that fails (or is cancelled) before that point leaves no
//! manifest and no final-named artifact behind.
//!
//! Lineage rules:
//! - Full never has a base.
//! - Incremental is based on the most recent backup of any type.
//! - Differential is based on the most recent Full, and falls back to a
//!   Full when there is none.

pub mod capture;

use crate::checksum::ChecksumVerifier;
use crate::config::Config;
use crate::fs::staging::{commit_part, discard_part, part_path, StagingArea};
use crate::fs::walker::{total_size, walk_directory_set, FileInfo, WalkOptions};
use crate::manifest::index::{diff_against, ChangeBaseline};
use crate::manifest::{
    ArtifactFormat, ArtifactKind, BackupManifest, BackupType, Codec, CompressionParams, FileIndex,
    ManifestStore, SourceDescriptor,
};
use crate::transfer::format_bytes;
use crate::utils::errors::{BackupError, Result};
use capture::{CaptureInput, CaptureRequest, CaptureTool};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::fmt;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where one `create` invocation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    Sizing,
    Capturing,
    Hashing,
    ManifestWritten,
    Done,
    Failed,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Idle => "idle",
            BackupState::Sizing => "sizing",
            BackupState::Capturing => "capturing",
            BackupState::Hashing => "hashing",
            BackupState::ManifestWritten => "manifest-written",
            BackupState::Done => "done",
            BackupState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Resolved lineage for a requested backup type, before anything is captured
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub requested: BackupType,
    /// What will actually be created (a Differential with no Full becomes Full)
    pub effective: BackupType,
    pub base: Option<BackupManifest>,
    pub source: SourceDescriptor,
}

impl BackupPlan {
    pub fn fell_back(&self) -> bool {
        self.requested != self.effective
    }
}

/// File-level change counts of a directory-set capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub scanned_files: usize,
    pub captured_files: usize,
    pub captured_bytes: u64,
    pub unchanged_files: usize,
    pub deleted_files: usize,
}

/// A completed backup: manifest persisted, artifact committed in staging.
pub struct CreatedBackup {
    pub manifest: BackupManifest,
    pub artifact: PathBuf,
    pub plan: BackupPlan,
    pub changes: Option<ChangeSummary>,
    /// Owns the artifact; dropping it removes the local copy unless kept
    pub staging: StagingArea,
}

/// Static inputs the engine needs from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backup_name: String,
    pub host: String,
    pub compression_level: i32,
    pub disk: Option<PathBuf>,
    pub directories: Vec<PathBuf>,
    pub exclude: Vec<String>,
    pub scratch_dir: PathBuf,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backup_name: config.general.backup_name().to_string(),
            host: config.general.server_id.clone(),
            compression_level: config.general.compression_level,
            disk: config.source.disk.clone(),
            directories: config.source.directories.clone(),
            exclude: config.source.exclude.clone(),
            scratch_dir: config.paths.scratch_dir.clone(),
        }
    }
}

/// What the capture step reads, after sizing
enum SizedSource {
    Disk {
        device: PathBuf,
        size: u64,
    },
    Files {
        changed: Vec<FileInfo>,
        index: FileIndex,
        summary: ChangeSummary,
    },
}

impl SizedSource {
    fn bytes(&self) -> u64 {
        match self {
            SizedSource::Disk { size, .. } => *size,
            SizedSource::Files { summary, .. } => summary.captured_bytes,
        }
    }
}

pub struct BackupEngine {
    settings: EngineSettings,
    store: Arc<ManifestStore>,
    capture: Arc<dyn CaptureTool>,
    cancel: CancellationToken,
    state: BackupState,
}

impl BackupEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<ManifestStore>,
        capture: Arc<dyn CaptureTool>,
    ) -> Self {
        Self::with_cancel(settings, store, capture, CancellationToken::new())
    }

    pub fn with_cancel(
        settings: EngineSettings,
        store: Arc<ManifestStore>,
        capture: Arc<dyn CaptureTool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            store,
            capture,
            cancel,
            state: BackupState::Idle,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn transition(&mut self, next: BackupState) {
        debug!(from = %self.state, to = %next, "Backup state");
        self.state = next;
    }

    pub async fn create_full(&mut self) -> Result<CreatedBackup> {
        self.create(BackupType::Full).await
    }

    pub async fn create_incremental(&mut self) -> Result<CreatedBackup> {
        self.create(BackupType::Incremental).await
    }

    pub async fn create_differential(&mut self) -> Result<CreatedBackup> {
        self.create(BackupType::Differential).await
    }

    /// Resolve the base and source of a backup without touching anything.
    pub fn plan(&self, requested: BackupType) -> Result<BackupPlan> {
        let (effective, base) = match requested {
            BackupType::Full => (BackupType::Full, None),
            BackupType::Incremental => (BackupType::Incremental, self.store.find_last(None)?),
            BackupType::Differential => match self.store.find_last(Some(BackupType::Full))? {
                Some(full) => (BackupType::Differential, Some(full)),
                None => {
                    warn!("No full backup to diff against, creating a full backup instead");
                    (BackupType::Full, None)
                }
            },
        };

        let source = match (effective, &self.settings.disk) {
            (BackupType::Full, Some(device)) => SourceDescriptor::Disk {
                device: device.clone(),
            },
            _ if self.settings.directories.is_empty() => {
                return Err(BackupError::Configuration(format!(
                    "{} backups need source.directories",
                    effective
                )))
            }
            _ => SourceDescriptor::Directories {
                paths: self.settings.directories.clone(),
            },
        };

        Ok(BackupPlan {
            requested,
            effective,
            base,
            source,
        })
    }

    /// Create a backup of the requested type. On success the manifest is
    /// durably in the store and the artifact sits in the returned staging area.
    pub async fn create(&mut self, requested: BackupType) -> Result<CreatedBackup> {
        self.transition(BackupState::Idle);
        let result = self.run(requested).await;

        match &result {
            Ok(created) => {
                self.transition(BackupState::Done);
                info!(
                    filename = %created.manifest.filename,
                    size = %format_bytes(created.manifest.size_bytes),
                    "Backup created"
                );
            }
            Err(e) => {
                self.transition(BackupState::Failed);
                error!(backup_type = %requested, "Backup failed: {}", e);
            }
        }
        result
    }

    async fn run(&mut self, requested: BackupType) -> Result<CreatedBackup> {
        let plan = self.plan(requested)?;
        info!(
            requested = %plan.requested,
            effective = %plan.effective,
            base = plan.base.as_ref().map(|b| b.filename.as_str()).unwrap_or("none"),
            source = %plan.source,
            "Starting backup"
        );

        self.transition(BackupState::Sizing);
        let sized = self.size_source(&plan).await?;
        warn_if_short_of_space(&self.settings.scratch_dir, sized.bytes());

        let timestamp = self.next_timestamp()?;
        let format = match sized {
            SizedSource::Disk { .. } => ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            SizedSource::Files { .. } => ArtifactFormat::new(ArtifactKind::Archive, Codec::Zstd),
        };
        let filename = self.unique_filename(plan.effective, &timestamp, format);

        self.transition(BackupState::Capturing);
        let staging = StagingArea::create(&self.settings.scratch_dir, "backup")?;
        let artifact = staging.file(&filename);
        let (input, expected_bytes) = match &sized {
            SizedSource::Disk { device, size } => (
                CaptureInput::Disk {
                    device: device.clone(),
                },
                *size,
            ),
            SizedSource::Files { changed, summary, .. } => (
                CaptureInput::Files {
                    files: changed.iter().map(|f| f.path.clone()).collect(),
                },
                summary.captured_bytes,
            ),
        };
        let request = CaptureRequest {
            input,
            output: part_path(&artifact),
            compression_level: self.settings.compression_level,
            expected_bytes,
        };

        let size_bytes = match self.capture.capture(&request, &self.cancel).await {
            Ok(size) => size,
            Err(e) => {
                discard_part(&artifact).await;
                return Err(e);
            }
        };
        if self.cancel.is_cancelled() {
            discard_part(&artifact).await;
            return Err(BackupError::Cancelled);
        }
        commit_part(&artifact).await?;

        self.transition(BackupState::Hashing);
        let checksum = ChecksumVerifier::with_cancel(self.cancel.clone())
            .sha256_file(&artifact)
            .await?;

        let manifest = BackupManifest {
            backup_type: plan.effective,
            timestamp,
            filename,
            source: Some(plan.source.clone()),
            size_bytes,
            checksum,
            compression: Some(CompressionParams {
                algorithm: Codec::Zstd,
                level: self.settings.compression_level,
            }),
            base_manifest: plan.base.as_ref().map(|b| b.filename.clone()),
            host: Some(self.settings.host.clone()),
        };

        let changes = match sized {
            SizedSource::Files { index, summary, .. } => {
                self.store.save_index(&manifest.filename, &index)?;
                Some(summary)
            }
            SizedSource::Disk { .. } => None,
        };
        self.store.save(&manifest)?;
        self.transition(BackupState::ManifestWritten);

        Ok(CreatedBackup {
            manifest,
            artifact,
            plan,
            changes,
            staging,
        })
    }

    async fn size_source(&self, plan: &BackupPlan) -> Result<SizedSource> {
        match &plan.source {
            SourceDescriptor::Disk { device } => {
                let device = device.clone();
                let size = tokio::task::spawn_blocking({
                    let device = device.clone();
                    move || device_size(&device)
                })
                .await
                .map_err(|e| BackupError::CaptureFailure(e.to_string()))??;
                info!(device = %device.display(), size = %format_bytes(size), "Sized disk");
                Ok(SizedSource::Disk { device, size })
            }
            SourceDescriptor::Directories { paths } => {
                let roots = paths.clone();
                let options = WalkOptions::excluding(&self.settings.exclude);
                let (files, missing) =
                    tokio::task::spawn_blocking(move || walk_directory_set(&roots, &options))
                        .await
                        .map_err(|e| BackupError::CaptureFailure(e.to_string()))?
                        .map_err(|e| BackupError::CaptureFailure(format!("walking sources: {}", e)))?;

                for root in &missing {
                    warn!(path = %root.display(), "Source directory does not exist, skipping");
                }
                if missing.len() == paths.len() {
                    return Err(BackupError::CaptureFailure(
                        "none of the source directories exist".into(),
                    ));
                }

                let index = FileIndex::from_files(&files);
                let scanned_files = files.len();
                let scanned_bytes = total_size(&files);

                let base_index = match &plan.base {
                    Some(base) => self.store.load_index(&base.filename)?,
                    None => None,
                };
                let baseline = match (&plan.base, &base_index) {
                    (None, _) => ChangeBaseline::Nothing,
                    (Some(_), Some(index)) => ChangeBaseline::Index(index),
                    (Some(base), None) => ChangeBaseline::ModifiedAfter(base.timestamp.timestamp()),
                };
                let diff = diff_against(files, baseline);

                info!(
                    scanned = scanned_files,
                    scanned_size = %format_bytes(scanned_bytes),
                    changed = diff.changed.len(),
                    changed_size = %format_bytes(diff.changed_bytes),
                    unchanged = diff.unchanged_files,
                    deleted = diff.deleted_files,
                    "Sized directory set"
                );

                let summary = ChangeSummary {
                    scanned_files,
                    captured_files: diff.changed.len(),
                    captured_bytes: diff.changed_bytes,
                    unchanged_files: diff.unchanged_files,
                    deleted_files: diff.deleted_files,
                };
                Ok(SizedSource::Files {
                    changed: diff.changed,
                    index,
                    summary,
                })
            }
        }
    }

    /// Now, but never earlier than (or equal to) the newest stored manifest.
    fn next_timestamp(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now().trunc_subsecs(6);
        Ok(match self.store.find_last(None)? {
            Some(last) if last.timestamp >= now => last.timestamp + Duration::microseconds(1),
            _ => now,
        })
    }

    /// Filenames carry second precision; same-second runs get a `-{seq}` suffix.
    fn unique_filename(
        &self,
        backup_type: BackupType,
        timestamp: &DateTime<Utc>,
        format: ArtifactFormat,
    ) -> String {
        let mut sequence = 0;
        loop {
            let name = BackupManifest::artifact_filename(
                &self.settings.backup_name,
                backup_type,
                timestamp,
                sequence,
                format,
            );
            if !self.store.contains(&name) {
                return name;
            }
            sequence += 1;
        }
    }
}

/// Length of a block device or regular file; block devices report 0 in
/// metadata, so seek to the end instead.
fn device_size(device: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(device).map_err(|e| {
        BackupError::CaptureFailure(format!("cannot open {}: {}", device.display(), e))
    })?;
    Ok(file.seek(SeekFrom::End(0))?)
}

fn warn_if_short_of_space(scratch_dir: &Path, needed: u64) {
    let statted = if scratch_dir.exists() {
        scratch_dir
    } else {
        scratch_dir.parent().unwrap_or(Path::new("/"))
    };
    match nix::sys::statvfs::statvfs(statted) {
        Ok(stat) => {
            let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            if free < needed {
                warn!(
                    scratch = %scratch_dir.display(),
                    free = %format_bytes(free),
                    source = %format_bytes(needed),
                    "Scratch space is smaller than the uncompressed source"
                );
            }
        }
        Err(e) => debug!(scratch = %scratch_dir.display(), "Cannot stat scratch filesystem: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes a fixed payload and records what it was asked to capture.
    struct RecordingCapture {
        payload: Vec<u8>,
        requests: Mutex<Vec<CaptureRequest>>,
    }

    impl RecordingCapture {
        fn new(payload: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                payload: payload.to_vec(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn captured_files(&self) -> Vec<Vec<PathBuf>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| match &r.input {
                    CaptureInput::Files { files } => files.clone(),
                    CaptureInput::Disk { device } => vec![device.clone()],
                })
                .collect()
        }
    }

    #[async_trait]
    impl CaptureTool for RecordingCapture {
        async fn capture(&self, request: &CaptureRequest, _: &CancellationToken) -> Result<u64> {
            self.requests.lock().unwrap().push(request.clone());
            tokio::fs::write(&request.output, &self.payload).await?;
            Ok(self.payload.len() as u64)
        }
    }

    struct FailingCapture;

    #[async_trait]
    impl CaptureTool for FailingCapture {
        async fn capture(&self, request: &CaptureRequest, _: &CancellationToken) -> Result<u64> {
            tokio::fs::write(&request.output, b"half").await?;
            Err(BackupError::CaptureFailure("source vanished".into()))
        }
    }

    struct Fixture {
        _root: TempDir,
        source: PathBuf,
        scratch: PathBuf,
        store: Arc<ManifestStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let source = root.path().join("data");
            std::fs::create_dir_all(&source).unwrap();
            std::fs::write(source.join("a.txt"), b"alpha").unwrap();
            std::fs::write(source.join("b.txt"), b"bravo").unwrap();
            let scratch = root.path().join("scratch");
            let store = Arc::new(ManifestStore::open(&root.path().join("manifests")).unwrap());
            Self {
                source,
                scratch,
                store,
                _root: root,
            }
        }

        fn settings(&self, disk: Option<PathBuf>) -> EngineSettings {
            EngineSettings {
                backup_name: "web".into(),
                host: "web01".into(),
                compression_level: 3,
                disk,
                directories: vec![self.source.clone()],
                exclude: Vec::new(),
                scratch_dir: self.scratch.clone(),
            }
        }

        fn engine(&self, capture: Arc<dyn CaptureTool>) -> BackupEngine {
            BackupEngine::new(self.settings(None), self.store.clone(), capture)
        }
    }

    /// Push a file's mtime into the future so size+mtime detection sees it.
    fn touch_later(path: &Path) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(120))
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_has_no_base_and_is_durable() {
        let fx = Fixture::new();
        let capture = RecordingCapture::new(b"archive bytes");
        let mut engine = fx.engine(capture.clone());

        let created = engine.create_full().await.unwrap();

        assert_eq!(engine.state(), BackupState::Done);
        assert_eq!(created.manifest.backup_type, BackupType::Full);
        assert!(created.manifest.base_manifest.is_none());
        assert!(created.manifest.filename.starts_with("web_full_"));
        assert!(created.manifest.filename.ends_with(".tar.zst"));
        assert_eq!(created.manifest.size_bytes, 13);
        assert_eq!(
            created.manifest.checksum,
            crate::checksum::sha256_bytes(b"archive bytes")
        );
        assert!(created.artifact.exists());
        assert!(!part_path(&created.artifact).exists());
        assert_eq!(
            fx.store.get(&created.manifest.filename).unwrap(),
            Some(created.manifest.clone())
        );
        assert!(fx.store.load_index(&created.manifest.filename).unwrap().is_some());
        assert_eq!(capture.captured_files()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_full_images_configured_disk() {
        let fx = Fixture::new();
        let disk = fx.source.join("a.txt");
        let mut engine = BackupEngine::new(
            fx.settings(Some(disk.clone())),
            fx.store.clone(),
            RecordingCapture::new(b"img"),
        );

        let created = engine.create_full().await.unwrap();
        assert!(created.manifest.filename.ends_with(".img.zst"));
        assert_eq!(created.manifest.source, Some(SourceDescriptor::Disk { device: disk }));
        assert!(fx.store.load_index(&created.manifest.filename).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_differential_without_full_falls_back() {
        let fx = Fixture::new();
        let mut engine = fx.engine(RecordingCapture::new(b"x"));

        let created = engine.create_differential().await.unwrap();
        assert!(created.plan.fell_back());
        assert_eq!(created.manifest.backup_type, BackupType::Full);
        assert!(created.manifest.base_manifest.is_none());
    }

    #[tokio::test]
    async fn test_differential_bases_on_last_full() {
        let fx = Fixture::new();
        let mut engine = fx.engine(RecordingCapture::new(b"x"));

        let full = engine.create_full().await.unwrap();
        let incremental = engine.create_incremental().await.unwrap();
        let differential = engine.create_differential().await.unwrap();

        assert_eq!(
            incremental.manifest.base_manifest.as_deref(),
            Some(full.manifest.filename.as_str())
        );
        assert_eq!(differential.manifest.backup_type, BackupType::Differential);
        assert_eq!(
            differential.manifest.base_manifest.as_deref(),
            Some(full.manifest.filename.as_str())
        );
    }

    #[tokio::test]
    async fn test_incremental_without_history_captures_everything() {
        let fx = Fixture::new();
        let capture = RecordingCapture::new(b"x");
        let mut engine = fx.engine(capture.clone());

        let created = engine.create_incremental().await.unwrap();
        assert_eq!(created.manifest.backup_type, BackupType::Incremental);
        assert!(created.manifest.base_manifest.is_none());
        assert_eq!(created.changes.unwrap().captured_files, 2);
    }

    #[tokio::test]
    async fn test_incremental_and_differential_capture_true_changes() {
        let fx = Fixture::new();
        let capture = RecordingCapture::new(b"x");
        let mut engine = fx.engine(capture.clone());

        engine.create_full().await.unwrap();

        std::fs::write(fx.source.join("a.txt"), b"alpha, edited").unwrap();
        let first = engine.create_incremental().await.unwrap();
        assert_eq!(first.changes.as_ref().unwrap().captured_files, 1);

        std::fs::write(fx.source.join("c.txt"), b"charlie").unwrap();
        touch_later(&fx.source.join("c.txt"));
        let second = engine.create_incremental().await.unwrap();
        let differential = engine.create_differential().await.unwrap();

        let files = capture.captured_files();
        // incremental after the first one: only the new file
        assert_eq!(files[2], vec![fx.source.join("c.txt")]);
        // differential against the full: both changes since then
        assert_eq!(
            files[3],
            vec![fx.source.join("a.txt"), fx.source.join("c.txt")]
        );
        assert_eq!(second.changes.unwrap().unchanged_files, 2);
        assert_eq!(differential.changes.unwrap().captured_files, 2);
    }

    #[tokio::test]
    async fn test_failed_capture_writes_no_manifest() {
        let fx = Fixture::new();
        let mut engine = fx.engine(Arc::new(FailingCapture));

        let err = match engine.create_full().await {
            Err(e) => e,
            Ok(_) => panic!("capture failure must fail the backup"),
        };
        assert!(matches!(err, BackupError::CaptureFailure(_)));
        assert_eq!(engine.state(), BackupState::Failed);
        assert!(fx.store.load_all().unwrap().is_empty());
        assert!(fx.store.find_last(None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_nothing() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut engine = BackupEngine::with_cancel(
            fx.settings(None),
            fx.store.clone(),
            RecordingCapture::new(b"x"),
            cancel,
        );

        let result = engine.create_full().await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert!(fx.store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_second_runs_get_unique_ordered_names() {
        let fx = Fixture::new();
        let mut engine = fx.engine(RecordingCapture::new(b"x"));

        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(engine.create_full().await.unwrap().manifest.filename);
        }

        let mut unique = names.clone();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        let stored: Vec<_> = fx
            .store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|m| m.filename)
            .collect();
        assert_eq!(stored, names);
        assert_eq!(fx.store.find_last(None).unwrap().unwrap().filename, names[2]);
    }

    #[tokio::test]
    async fn test_missing_sources_fail_the_run() {
        let fx = Fixture::new();
        let mut settings = fx.settings(None);
        settings.directories = vec![PathBuf::from("/nonexistent/source")];
        let mut engine = BackupEngine::new(settings, fx.store.clone(), RecordingCapture::new(b"x"));

        let result = engine.create_full().await;
        assert!(matches!(result, Err(BackupError::CaptureFailure(_))));
        assert!(fx.store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_plan_does_not_touch_store() {
        let fx = Fixture::new();
        let engine = fx.engine(RecordingCapture::new(b"x"));

        let plan = engine.plan(BackupType::Incremental).unwrap();
        assert_eq!(plan.effective, BackupType::Incremental);
        assert!(plan.base.is_none());
        assert!(fx.store.load_all().unwrap().is_empty());
        assert_eq!(engine.state(), BackupState::Idle);
    }
}
