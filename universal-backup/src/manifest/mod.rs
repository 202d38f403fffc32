//! Backup manifests: one immutable metadata record per completed backup.
//!
//! A manifest is validated once, when it is parsed. Everything downstream
//! works with the typed record and never re-checks optional fields.
//! Sidecars written by older tooling (`checksum_sha256`, `base_backup`,
//! `source_disk`, ...) are accepted at the same boundary.

pub mod index;
pub mod store;

use crate::checksum::is_sha256_hex;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use index::FileIndex;
pub use store::ManifestStore;

/// Suffix of the manifest sidecar stored next to every blob
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Timestamp layout embedded in artifact filenames
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        }
    }

    /// Recover the type from a `{name}_{type}_{timestamp}` filename.
    pub fn from_filename(filename: &str) -> Option<Self> {
        [BackupType::Full, BackupType::Incremental, BackupType::Differential]
            .into_iter()
            .find(|t| filename.contains(&format!("_{}_", t.as_str())))
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

/// What a backup captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDescriptor {
    /// Raw block device image
    Disk { device: PathBuf },
    /// Archive of a directory set; member paths are relative to `/`
    Directories { paths: Vec<PathBuf> },
}

impl SourceDescriptor {
    /// Where a replay goes when the operator names no target.
    pub fn default_restore_target(&self) -> PathBuf {
        match self {
            SourceDescriptor::Disk { device } => device.clone(),
            SourceDescriptor::Directories { .. } => PathBuf::from("/"),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Disk { device } => write!(f, "disk {}", device.display()),
            SourceDescriptor::Directories { paths } => {
                let joined: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                write!(f, "directories [{}]", joined.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Zstd,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DiskImage,
    Archive,
}

/// Payload layout and compression, derived from the artifact filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactFormat {
    pub kind: ArtifactKind,
    pub codec: Codec,
}

impl ArtifactFormat {
    pub fn new(kind: ArtifactKind, codec: Codec) -> Self {
        Self { kind, codec }
    }

    pub fn extension(&self) -> &'static str {
        match (self.kind, self.codec) {
            (ArtifactKind::DiskImage, Codec::Zstd) => "img.zst",
            (ArtifactKind::DiskImage, Codec::Gzip) => "img.gz",
            (ArtifactKind::Archive, Codec::Zstd) => "tar.zst",
            (ArtifactKind::Archive, Codec::Gzip) => "tar.gz",
        }
    }

    pub fn from_filename(filename: &str) -> Option<Self> {
        let formats = [
            ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Zstd),
            ArtifactFormat::new(ArtifactKind::DiskImage, Codec::Gzip),
            ArtifactFormat::new(ArtifactKind::Archive, Codec::Zstd),
            ArtifactFormat::new(ArtifactKind::Archive, Codec::Gzip),
        ];
        formats
            .into_iter()
            .find(|f| filename.ends_with(&format!(".{}", f.extension())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionParams {
    pub algorithm: Codec,
    pub level: i32,
}

/// Metadata record describing one backup artifact's lineage and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ManifestRecord")]
pub struct BackupManifest {
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub source: Option<SourceDescriptor>,
    pub size_bytes: u64,
    pub checksum: String,
    pub compression: Option<CompressionParams>,
    pub base_manifest: Option<String>,
    pub host: Option<String>,
}

impl BackupManifest {
    /// Sidecar object name for a blob
    pub fn sidecar_name(filename: &str) -> String {
        format!("{}{}", filename, MANIFEST_SUFFIX)
    }

    pub fn is_sidecar_name(name: &str) -> bool {
        name.ends_with(MANIFEST_SUFFIX)
    }

    /// `{name}_{type}_{timestamp}[-{seq}].{ext}`
    pub fn artifact_filename(
        name: &str,
        backup_type: BackupType,
        timestamp: &DateTime<Utc>,
        sequence: u32,
        format: ArtifactFormat,
    ) -> String {
        let stamp = timestamp.format(FILENAME_TIMESTAMP_FORMAT);
        if sequence == 0 {
            format!("{}_{}_{}.{}", name, backup_type, stamp, format.extension())
        } else {
            format!(
                "{}_{}_{}-{}.{}",
                name,
                backup_type,
                stamp,
                sequence,
                format.extension()
            )
        }
    }

    pub fn format(&self) -> Option<ArtifactFormat> {
        ArtifactFormat::from_filename(&self.filename)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| crate::BackupError::InvalidManifest(e.to_string()))
    }
}

/// Wire shape of a manifest: every field optional, validated in `TryFrom`.
#[derive(Debug, Deserialize)]
struct ManifestRecord {
    #[serde(rename = "type", default)]
    backup_type: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    source: Option<SourceDescriptor>,
    #[serde(default)]
    source_disk: Option<PathBuf>,
    #[serde(default)]
    backed_up_dirs: Option<Vec<PathBuf>>,
    #[serde(default, alias = "backup_size_bytes")]
    size_bytes: Option<u64>,
    #[serde(default, alias = "checksum_sha256")]
    checksum: Option<String>,
    #[serde(default)]
    compression: Option<CompressionParams>,
    #[serde(default)]
    compression_level: Option<i32>,
    #[serde(default, alias = "base_backup")]
    base_manifest: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

impl TryFrom<ManifestRecord> for BackupManifest {
    type Error = String;

    fn try_from(record: ManifestRecord) -> Result<Self, Self::Error> {
        let filename = record
            .filename
            .filter(|f| !f.trim().is_empty())
            .ok_or("manifest has no filename")?;

        let checksum = record
            .checksum
            .map(|c| c.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("manifest for {} has no checksum", filename))?;
        if !is_sha256_hex(&checksum) {
            return Err(format!(
                "manifest for {} has malformed checksum '{}'",
                filename, checksum
            ));
        }

        let backup_type = match record.backup_type {
            Some(t) => t.parse::<BackupType>()?,
            None => BackupType::from_filename(&filename).unwrap_or(BackupType::Full),
        };

        let timestamp = record
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| timestamp_from_filename(&filename))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let base_manifest = record.base_manifest.filter(|b| !b.is_empty());
        if backup_type == BackupType::Full && base_manifest.is_some() {
            return Err(format!("full manifest {} must not reference a base", filename));
        }

        let source = record.source.or_else(|| {
            record
                .source_disk
                .map(|device| SourceDescriptor::Disk { device })
                .or_else(|| {
                    record
                        .backed_up_dirs
                        .map(|paths| SourceDescriptor::Directories { paths })
                })
        });

        let compression = record.compression.or_else(|| {
            record.compression_level.map(|level| CompressionParams {
                algorithm: ArtifactFormat::from_filename(&filename)
                    .map(|f| f.codec)
                    .unwrap_or(Codec::Gzip),
                level,
            })
        });

        Ok(BackupManifest {
            backup_type,
            timestamp,
            filename,
            source,
            size_bytes: record.size_bytes.unwrap_or(0),
            checksum,
            compression,
            base_manifest,
            host: record.host,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, FILENAME_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The 19 characters after `_{type}_` hold the creation second.
fn timestamp_from_filename(filename: &str) -> Option<DateTime<Utc>> {
    let backup_type = BackupType::from_filename(filename)?;
    let marker = format!("_{}_", backup_type);
    let start = filename.find(&marker)? + marker.len();
    let stamp = filename.get(start..start + 19)?;
    parse_timestamp(stamp)
}
