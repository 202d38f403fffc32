//! Configuration management for universal-backup.
//!
//! Loaded once at process start from an optional TOML file with
//! `UBACKUP__SECTION__KEY` environment variable overrides, then passed
//! explicitly into every component constructor.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Used when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/universal-backup/backup.toml";

const ENV_PREFIX: &str = "UBACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub paths: PathsConfig,
    pub source: SourceConfig,
    pub retention: RetentionConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Host identity recorded in every manifest
    pub server_id: String,

    /// Prefix of artifact filenames (defaults to server_id)
    pub backup_name: Option<String>,

    /// zstd compression level
    pub compression_level: i32,

    /// Where run summaries are mailed
    pub notification_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local manifest store
    pub manifest_dir: PathBuf,

    /// Staging area for captured and downloaded artifacts
    pub scratch_dir: PathBuf,

    /// Run lock (defaults to `{manifest_dir}/.lock`)
    pub lock_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Block device imaged by Full backups. When unset, Full backups
    /// capture the directory set instead.
    pub disk: Option<PathBuf>,

    /// Directory set tracked by incremental and differential backups
    pub directories: Vec<PathBuf>,

    /// File name substrings skipped while walking
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Flat cap on the number of blobs per backend
    pub max_count: usize,

    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Attempts per upload/download call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Chunk size for multipart and resumable uploads
    pub chunk_size_mb: usize,

    /// Re-read listing and sidecar after upload to cross-check the manifest
    pub verify_after_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// One configured storage target, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    S3(S3Settings),
    Gcs(GcsSettings),
    Gdrive(GDriveSettings),
    Local(LocalSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// S3-compatible endpoint (MinIO, Wasabi, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_s3_storage_class")]
    pub storage_class: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsSettings {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Needed only when the bucket has to be created
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_gcs_location")]
    pub location: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_gcs_storage_class")]
    pub storage_class: String,
    /// Service account key file
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveSettings {
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub shared_drive_id: Option<String>,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSettings {
    pub path: PathBuf,
}

// Default values
fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-server".to_string())
}

fn default_bucket() -> String {
    "universal-backups".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_storage_class() -> String {
    "STANDARD_IA".to_string()
}

fn default_gcs_location() -> String {
    "US".to_string()
}

fn default_gcs_storage_class() -> String {
    "NEARLINE".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            backup_name: None,
            compression_level: 6,
            notification_email: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("/var/lib/universal-backup/manifests"),
            scratch_dir: PathBuf::from("/tmp/universal-backup"),
            lock_file: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            disk: None,
            directories: ["/etc", "/home", "/var/www", "/opt", "/root", "/usr/local"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            exclude: Vec::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: 5,
            keep_daily: None,
            keep_weekly: None,
            keep_monthly: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            chunk_size_mb: 16,
            verify_after_upload: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    pub fn backup_name(&self) -> &str {
        self.backup_name.as_deref().unwrap_or(&self.server_id)
    }
}

impl PathsConfig {
    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.manifest_dir.join(".lock"))
    }
}

impl TransferConfig {
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_mb * 1024 * 1024
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::S3(_) => "s3",
            BackendConfig::Gcs(_) => "gcs",
            BackendConfig::Gdrive(_) => "gdrive",
            BackendConfig::Local(_) => "local",
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(BackupError::Configuration(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                builder = builder
                    .add_source(config::File::with_name(DEFAULT_CONFIG_PATH).required(false));
            }
        }

        builder = builder.add_source(env_source());

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.general.compression_level) {
            return Err(BackupError::Configuration(format!(
                "general.compression_level {} outside {}..={}",
                self.general.compression_level,
                levels.start(),
                levels.end()
            )));
        }

        let name = self.general.backup_name();
        if name.is_empty() || name.contains('/') {
            return Err(BackupError::Configuration(format!(
                "invalid backup name '{}'",
                name
            )));
        }

        if self.retention.max_count == 0 {
            return Err(BackupError::Configuration(
                "retention.max_count must be at least 1".into(),
            ));
        }

        if self.transfer.max_attempts == 0 || self.transfer.chunk_size_mb == 0 {
            return Err(BackupError::Configuration(
                "transfer.max_attempts and transfer.chunk_size_mb must be positive".into(),
            ));
        }

        if self.source.disk.is_none() && self.source.directories.is_empty() {
            return Err(BackupError::Configuration(
                "either source.disk or source.directories must be set".into(),
            ));
        }

        for name in self.backends.keys() {
            if name.is_empty() || name == "all" {
                return Err(BackupError::Configuration(format!(
                    "invalid backend name '{}'",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("source.directories")
        .with_list_parse_key("source.exclude")
        .try_parsing(true)
}
