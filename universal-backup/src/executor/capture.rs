//! Capture tools turn a source into a compressed artifact on local disk.
//!
//! Disk sources are streamed raw from the block device into a zstd encoder.
//! File sets are archived by the system `tar` (which keeps ownership, modes
//! and symlinks) and its output stream is compressed the same way. The tool
//! writes exactly the path it is given; naming and committing the final
//! artifact is the engine's job.

use crate::transfer::{logging_callback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read size for raw device streaming
const DEVICE_READ_SIZE: usize = 4 * 1024 * 1024;

/// What to read
#[derive(Debug, Clone)]
pub enum CaptureInput {
    /// Raw block device (or image file)
    Disk { device: PathBuf },
    /// Absolute paths of the files to archive; archived relative to `/`
    Files { files: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub input: CaptureInput,
    /// Where the compressed artifact is written
    pub output: PathBuf,
    pub compression_level: i32,
    /// Expected input size, for progress only
    pub expected_bytes: u64,
}

#[async_trait]
pub trait CaptureTool: Send + Sync {
    /// Produce the artifact at `request.output` and return its size in bytes.
    /// On error or cancellation the output may be partial; the caller
    /// discards it.
    async fn capture(&self, request: &CaptureRequest, cancel: &CancellationToken) -> Result<u64>;
}

/// zstd device images and tar+zstd archives
#[derive(Debug, Clone)]
pub struct NativeCapture {
    tar_program: PathBuf,
}

impl Default for NativeCapture {
    fn default() -> Self {
        Self {
            tar_program: PathBuf::from("tar"),
        }
    }
}

impl NativeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tar(tar_program: impl Into<PathBuf>) -> Self {
        Self {
            tar_program: tar_program.into(),
        }
    }

    async fn capture_disk(
        &self,
        device: &Path,
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let source = tokio::fs::File::open(device).await.map_err(|e| {
            BackupError::CaptureFailure(format!("cannot open {}: {}", device.display(), e))
        })?;
        info!(device = %device.display(), output = %request.output.display(), "Imaging disk");

        let stream = ReaderStream::with_capacity(source, DEVICE_READ_SIZE);
        compress_stream(stream, request, &format!("imaging {}", device.display()), cancel).await
    }

    async fn capture_files(
        &self,
        files: &[PathBuf],
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut child = Command::new(&self.tar_program)
            .args(["--create", "--file=-", "--directory=/", "--null", "--no-recursion", "--files-from=-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::CaptureFailure(format!(
                    "cannot start {}: {}",
                    self.tar_program.display(),
                    e
                ))
            })?;

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BackupError::CaptureFailure("tar pipes unavailable".into()));
        };

        let file_list = null_separated(files);
        info!(files = files.len(), output = %request.output.display(), "Archiving file set");

        // tar reads its list while we drain its output
        let feeder = tokio::spawn(async move {
            let written = stdin.write_all(&file_list).await;
            drop(stdin);
            written
        });
        let errors = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let compressed = compress_stream(
            ReaderStream::new(stdout),
            request,
            "archiving file set",
            cancel,
        )
        .await;

        let size = match compressed {
            Ok(size) => size,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let status = child.wait().await?;
        let stderr_text = errors.await.unwrap_or_default();
        match feeder.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BackupError::CaptureFailure(format!(
                    "writing file list to tar: {}",
                    e
                )))
            }
            Err(e) => return Err(BackupError::CaptureFailure(e.to_string())),
        }

        match status.code() {
            Some(0) => {}
            // GNU tar: some files changed while being read
            Some(1) => warn!("tar reported files changed during capture: {}", stderr_text.trim()),
            Some(2) if only_vanished_files(&stderr_text) => warn!(
                "files disappeared during capture and were skipped: {}",
                stderr_text.trim()
            ),
            _ => {
                return Err(BackupError::CaptureFailure(format!(
                    "tar exited with {}: {}",
                    status,
                    stderr_text.trim()
                )))
            }
        }

        Ok(size)
    }
}

#[async_trait]
impl CaptureTool for NativeCapture {
    async fn capture(&self, request: &CaptureRequest, cancel: &CancellationToken) -> Result<u64> {
        match &request.input {
            CaptureInput::Disk { device } => self.capture_disk(device, request, cancel).await,
            CaptureInput::Files { files } => self.capture_files(files, request, cancel).await,
        }
    }
}

/// True when every tar diagnostic is about a file that was removed or
/// changed between the walk and the read.
fn only_vanished_files(stderr: &str) -> bool {
    const VANISHED: &[&str] = &[
        "Cannot stat: No such file or directory",
        "File removed before we read it",
        "file changed as we read it",
        "Exiting with failure status due to previous errors",
    ];

    let mut diagnostics = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
    diagnostics.peek().is_some()
        && diagnostics.all(|line| VANISHED.iter().any(|v| line.ends_with(v)))
}

/// Paths relative to `/`, NUL-terminated, as `tar --null --files-from` reads them.
fn null_separated(files: &[PathBuf]) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;

    let mut list = Vec::new();
    for file in files {
        let relative = file.strip_prefix("/").unwrap_or(file);
        list.extend_from_slice(relative.as_os_str().as_bytes());
        list.push(0);
    }
    list
}

/// Compress `stream` into `request.output`, honouring cancellation between
/// chunks. Returns the compressed size.
async fn compress_stream<S>(
    stream: S,
    request: &CaptureRequest,
    label: &str,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let output = tokio::fs::File::create(&request.output).await?;
    let mut encoder = ZstdEncoder::with_quality(output, Level::Precise(request.compression_level));
    let mut stream = ProgressStream::new(stream, logging_callback(label, request.expected_bytes));
    let mut read = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| BackupError::CaptureFailure(format!("{}: {}", label, e)))?;
        read += chunk.len() as u64;
        encoder.write_all(&chunk).await?;
    }

    encoder.shutdown().await?;
    let output = encoder.into_inner();
    output.sync_all().await?;

    let size = output.metadata().await?.len();
    debug!(read, compressed = size, "Capture stream finished");
    Ok(size)
}
