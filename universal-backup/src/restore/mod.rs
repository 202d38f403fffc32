//! Restore engine - resolve, download, verify, replay.
//!
//! The checksum check is the gate in front of every destructive write: the
//! only way to obtain a [`VerifiedArtifact`] is `download_and_verify`, and a
//! digest mismatch never produces one.

pub mod confirm;
pub mod replay;

use crate::checksum::{ChecksumVerifier, Verification};
use crate::fs::staging::StagingArea;
use crate::manifest::{ArtifactFormat, BackupManifest};
use crate::storage::{StorageBackend, StoredBlob};
use crate::transfer::format_bytes;
use crate::utils::errors::{BackupError, Result};
use confirm::{is_confirmed, Confirmation, CONFIRMATION_TOKEN};
use replay::{ReplayRequest, ReplayTool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Selects the most recently modified blob on the backend
pub const LATEST: &str = "latest";

/// How much consent a restore has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Ask the operator for the confirmation token
    Interactive,
    /// No operator: refuse rather than assume consent
    NonInteractive,
    /// Resolve the target and stop before writing
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { target: PathBuf, bytes_written: u64 },
    DryRun { target: PathBuf },
}

/// A downloaded artifact that passed (or had nothing to) verification.
pub struct VerifiedArtifact {
    blob: StoredBlob,
    manifest: Option<BackupManifest>,
    path: PathBuf,
    verification: Verification,
    staging: StagingArea,
}

impl VerifiedArtifact {
    pub fn blob(&self) -> &StoredBlob {
        &self.blob
    }

    pub fn manifest(&self) -> Option<&BackupManifest> {
        self.manifest.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    /// Keep the downloaded file after the artifact is dropped.
    pub fn keep_local(&mut self, keep: bool) {
        self.staging.keep(keep);
    }
}

pub struct RestoreEngine {
    backend: Arc<dyn StorageBackend>,
    replay: Arc<dyn ReplayTool>,
    scratch_dir: PathBuf,
    cancel: CancellationToken,
}

impl RestoreEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        replay: Arc<dyn ReplayTool>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            replay,
            scratch_dir: scratch_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// `latest` is the first (most recently modified) listed blob; anything
    /// else must match a blob name exactly.
    pub async fn resolve(&self, selector: &str) -> Result<StoredBlob> {
        let blobs = self.backend.list().await?;

        let found = if selector == LATEST {
            blobs.into_iter().next()
        } else {
            blobs.into_iter().find(|b| b.name == selector)
        };

        found.ok_or_else(|| {
            BackupError::NotFound(format!(
                "no backup '{}' on backend {}",
                selector,
                self.backend.name()
            ))
        })
    }

    /// Download the blob and its sidecar and check the digest. A missing
    /// sidecar skips verification (reported as skipped); a mismatch fails.
    pub async fn download_and_verify(&self, selector: &str) -> Result<VerifiedArtifact> {
        let blob = self.resolve(selector).await?;
        info!(
            backend = %self.backend.name(),
            blob = %blob.name,
            size = %format_bytes(blob.size),
            modified = %blob.last_modified,
            "Resolved backup"
        );

        let manifest = self.backend.get_manifest(&blob.name).await?;
        if manifest.is_none() {
            warn!(blob = %blob.name, "No manifest sidecar; integrity cannot be verified");
        }

        let staging = StagingArea::create(&self.scratch_dir, "restore")?;
        let path = staging.file(&blob.name);
        self.backend.download(&blob.name, &path).await?;

        let local_size = tokio::fs::metadata(&path).await?.len();
        if local_size != blob.size {
            warn!(
                blob = %blob.name,
                listed = blob.size,
                downloaded = local_size,
                "Downloaded size differs from backend listing"
            );
        }

        let verifier = ChecksumVerifier::with_cancel(self.cancel.clone());
        let verification = match &manifest {
            Some(manifest) => {
                if manifest.filename != blob.name {
                    warn!(
                        blob = %blob.name,
                        manifest = %manifest.filename,
                        "Manifest names a different file"
                    );
                }
                if manifest.size_bytes != 0 && manifest.size_bytes != local_size {
                    warn!(
                        blob = %blob.name,
                        manifest = manifest.size_bytes,
                        downloaded = local_size,
                        "Downloaded size differs from manifest"
                    );
                }
                let checksum = verifier.verify(&path, &manifest.checksum).await?;
                Verification::Passed { checksum }
            }
            None => Verification::Skipped {
                reason: "manifest sidecar missing".to_string(),
            },
        };

        Ok(VerifiedArtifact {
            blob,
            manifest,
            path,
            verification,
            staging,
        })
    }

    /// Explicit target, else the manifest's recorded source. Never a guess.
    pub fn resolve_target(
        verified: &VerifiedArtifact,
        explicit: Option<&Path>,
    ) -> Result<PathBuf> {
        if let Some(target) = explicit {
            return Ok(target.to_path_buf());
        }
        verified
            .manifest
            .as_ref()
            .and_then(|m| m.source.as_ref())
            .map(|source| source.default_restore_target())
            .ok_or_else(|| {
                BackupError::RestoreRefused(format!(
                    "no target given and {} records no source; pass --target",
                    verified.blob.name
                ))
            })
    }

    /// Write a verified artifact onto its target. Destructive.
    pub async fn restore(
        &self,
        verified: &VerifiedArtifact,
        target: Option<&Path>,
        mode: RestoreMode,
        confirmation: &dyn Confirmation,
    ) -> Result<RestoreOutcome> {
        let target = Self::resolve_target(verified, target)?;
        let format = verified
            .manifest
            .as_ref()
            .and_then(|m| m.format())
            .or_else(|| ArtifactFormat::from_filename(&verified.blob.name))
            .ok_or_else(|| {
                BackupError::RestoreRefused(format!(
                    "cannot tell the format of {}",
                    verified.blob.name
                ))
            })?;

        match mode {
            RestoreMode::DryRun => {
                info!(
                    blob = %verified.blob.name,
                    dest = %target.display(),
                    "Dry run: would restore"
                );
                return Ok(RestoreOutcome::DryRun { target });
            }
            RestoreMode::NonInteractive => {
                return Err(BackupError::RestoreRefused(format!(
                    "restoring {} onto {} needs interactive confirmation",
                    verified.blob.name,
                    target.display()
                )));
            }
            RestoreMode::Interactive => {}
        }

        let mut prompt = format!(
            "\nWARNING: this will overwrite {}\nwith backup {} ({}).\n",
            target.display(),
            verified.blob.name,
            format_bytes(verified.blob.size)
        );
        if let Verification::Skipped { reason } = &verified.verification {
            prompt.push_str(&format!("Integrity was NOT verified: {}.\n", reason));
        }
        prompt.push_str(&format!("Type {} to continue: ", CONFIRMATION_TOKEN));

        let answer = confirmation.ask(&prompt).await?;
        if !is_confirmed(&answer) {
            return Err(BackupError::RestoreRefused(format!(
                "restore onto {} not confirmed",
                target.display()
            )));
        }

        let request = ReplayRequest {
            artifact: verified.path.clone(),
            format,
            target: target.clone(),
            artifact_bytes: verified.blob.size,
        };
        info!(blob = %verified.blob.name, dest = %target.display(), "Restoring");

        match self.replay.replay(&request, &self.cancel).await {
            Ok(bytes_written) => {
                info!(
                    dest = %target.display(),
                    written = %format_bytes(bytes_written),
                    "Restore complete"
                );
                Ok(RestoreOutcome::Restored {
                    target,
                    bytes_written,
                })
            }
            Err(e) => {
                error!(dest = %target.display(), "Restore failed: {}", e);
                Err(e)
            }
        }
    }
}
