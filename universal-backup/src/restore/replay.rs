//! Replay tools write a downloaded artifact back onto its target.
//!
//! Disk images are decompressed straight onto the device and synced. Archives
//! are decompressed into `tar --extract` rooted at the target directory.
//! Legacy gzip artifacts are read as well as zstd ones.

use crate::manifest::{ArtifactFormat, ArtifactKind, Codec};
use crate::transfer::{logging_callback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WRITE_CHUNK: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub artifact: PathBuf,
    pub format: ArtifactFormat,
    /// Block device for images, directory for archives
    pub target: PathBuf,
    /// Compressed artifact size, for progress only
    pub artifact_bytes: u64,
}

#[async_trait]
pub trait ReplayTool: Send + Sync {
    /// Write the decompressed artifact to the target. Returns the number of
    /// decompressed bytes written.
    async fn replay(&self, request: &ReplayRequest, cancel: &CancellationToken) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct NativeReplay {
    tar_program: PathBuf,
}

impl Default for NativeReplay {
    fn default() -> Self {
        Self {
            tar_program: PathBuf::from("tar"),
        }
    }
}

impl NativeReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tar(tar_program: impl Into<PathBuf>) -> Self {
        Self {
            tar_program: tar_program.into(),
        }
    }

    async fn replay_image(&self, request: &ReplayRequest, cancel: &CancellationToken) -> Result<u64> {
        let mut device = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&request.target)
            .await
            .map_err(|e| {
                BackupError::RestoreRefused(format!(
                    "cannot open target {}: {}",
                    request.target.display(),
                    e
                ))
            })?;

        info!(dest = %request.target.display(), "Writing disk image");
        let written = pump(request, &mut device, cancel).await?;
        device.flush().await?;
        // A regular-file target may be longer than the image
        if device.metadata().await?.is_file() {
            device.set_len(written).await?;
        }
        device.sync_all().await?;
        Ok(written)
    }

    async fn replay_archive(&self, request: &ReplayRequest, cancel: &CancellationToken) -> Result<u64> {
        tokio::fs::create_dir_all(&request.target).await?;

        let mut child = Command::new(&self.tar_program)
            .arg("--extract")
            .arg("--file=-")
            .arg("--preserve-permissions")
            .arg("--numeric-owner")
            .arg(format!("--directory={}", request.target.display()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::Transfer(format!("cannot start {}: {}", self.tar_program.display(), e))
            })?;

        let (Some(mut stdin), Some(mut stderr)) = (child.stdin.take(), child.stderr.take()) else {
            return Err(BackupError::Transfer("tar pipes unavailable".into()));
        };
        let errors = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        info!(dest = %request.target.display(), "Extracting archive");
        let pumped = pump(request, &mut stdin, cancel).await;
        drop(stdin);

        let written = match pumped {
            Ok(written) => written,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let status = child.wait().await?;
        let stderr_text = errors.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::Transfer(format!(
                "tar exited with {}: {}",
                status,
                stderr_text.trim()
            )));
        }
        if !stderr_text.trim().is_empty() {
            warn!("tar: {}", stderr_text.trim());
        }
        Ok(written)
    }
}

#[async_trait]
impl ReplayTool for NativeReplay {
    async fn replay(&self, request: &ReplayRequest, cancel: &CancellationToken) -> Result<u64> {
        match request.format.kind {
            ArtifactKind::DiskImage => self.replay_image(request, cancel).await,
            ArtifactKind::Archive => self.replay_archive(request, cancel).await,
        }
    }
}

/// Decompressing reader over an artifact file
pub async fn open_decoder(
    artifact: &Path,
    codec: Codec,
) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    let file = BufReader::new(tokio::fs::File::open(artifact).await?);
    Ok(match codec {
        Codec::Zstd => {
            let mut decoder = ZstdDecoder::new(file);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        Codec::Gzip => {
            let mut decoder = GzipDecoder::new(file);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
    })
}

/// Copy the decompressed artifact into `sink`, checking for cancellation
/// between chunks.
async fn pump<W>(request: &ReplayRequest, sink: &mut W, cancel: &CancellationToken) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let decoder = open_decoder(&request.artifact, request.format.codec).await?;
    let label = format!("restoring {}", request.target.display());
    let mut stream = ProgressStream::new(
        ReaderStream::with_capacity(decoder, WRITE_CHUNK),
        logging_callback(label, 0),
    );
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| {
            BackupError::Transfer(format!("decompressing {}: {}", request.artifact.display(), e))
        })?;
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    info!(
        artifact = %request.artifact.display(),
        compressed = request.artifact_bytes,
        written,
        "Replay stream finished"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_zstd_image_replays_onto_target() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..2_000_000u32).map(|i| (i % 13) as u8).collect();
        let artifact = dir.path().join("disk.img.zst");
        std::fs::write(&artifact, zstd::encode_all(&data[..], 3).unwrap()).unwrap();
        let target = dir.path().join("device");
        std::fs::write(&target, b"").unwrap();

        let request = ReplayRequest {
            artifact,
            format: ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            target: target.clone(),
            artifact_bytes: 0,
        };
        let written = NativeReplay::new()
            .replay(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_image_replay_shrinks_longer_file_target() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("disk.img.zst");
        std::fs::write(&artifact, zstd::encode_all(&b"fresh image"[..], 3).unwrap()).unwrap();
        let target = dir.path().join("device");
        std::fs::write(&target, vec![0xAA; 4096]).unwrap();

        let request = ReplayRequest {
            artifact,
            format: ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            target: target.clone(),
            artifact_bytes: 0,
        };
        NativeReplay::new()
            .replay(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"fresh image");
    }

    #[tokio::test]
    async fn test_legacy_gzip_decodes() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("old.img.gz");
        let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
        encoder.write_all(b"legacy image contents").await.unwrap();
        encoder.shutdown().await.unwrap();
        std::fs::write(&artifact, encoder.into_inner()).unwrap();

        let mut reader = open_decoder(&artifact, Codec::Gzip).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"legacy image contents");
    }

    #[tokio::test]
    async fn test_missing_image_target_is_refused() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("disk.img.zst");
        std::fs::write(&artifact, zstd::encode_all(&b"x"[..], 3).unwrap()).unwrap();

        let request = ReplayRequest {
            artifact,
            format: ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            target: dir.path().join("no/such/device"),
            artifact_bytes: 0,
        };
        let result = NativeReplay::new()
            .replay(&request, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BackupError::RestoreRefused(_))));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("disk.img.zst");
        std::fs::write(&artifact, b"definitely not zstd").unwrap();
        let target = dir.path().join("device");
        std::fs::write(&target, b"").unwrap();

        let request = ReplayRequest {
            artifact,
            format: ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            target,
            artifact_bytes: 0,
        };
        let result = NativeReplay::new()
            .replay(&request, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BackupError::Transfer(_))));
    }
}
