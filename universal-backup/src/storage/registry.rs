//! Backend name → constructed instance, resolved once at startup.

use super::gcs::GcsBackend;
use super::gdrive::GDriveBackend;
use super::local::LocalBackend;
use super::s3::S3Backend;
use super::{RetryPolicy, StorageBackend};
use crate::config::{BackendConfig, Config};
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Selector that expands to every configured backend
pub const ALL_BACKENDS: &str = "all";

#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
    /// Selected backends that could not be constructed, with the reason
    unavailable: BTreeMap<String, String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct the named backends (or all of them when `names` is empty).
    /// Credentials are resolved here, once. A backend that cannot be built
    /// is recorded as unavailable and the rest are still returned; the call
    /// fails only when none of the selected backends could be built.
    pub async fn from_config(config: &Config, names: &[String]) -> Result<Self> {
        let selected = select(config, names)?;
        let mut registry = Self::new();
        let mut last_error = None;

        for name in selected {
            let Some(backend_config) = config.backends.get(&name) else {
                continue;
            };
            match build(&name, backend_config, config).await {
                Ok(backend) => {
                    info!(backend = %name, kind = backend.kind(), "Backend ready");
                    registry.insert(backend);
                }
                Err(e) => {
                    warn!(backend = %name, kind = backend_config.kind(), "Backend unavailable: {}", e);
                    registry.unavailable.insert(name, e.to_string());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if registry.is_empty() => Err(e),
            _ => Ok(registry),
        }
    }

    pub fn insert(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        if let Some(backend) = self.backends.get(name) {
            return Ok(backend.clone());
        }
        Err(match self.unavailable.get(name) {
            Some(reason) => BackupError::Provisioning(format!(
                "backend '{}' is unavailable: {}",
                name, reason
            )),
            None => BackupError::Configuration(format!("unknown backend '{}'", name)),
        })
    }

    /// Selected backends that failed to build, by name
    pub fn unavailable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.unavailable
            .iter()
            .map(|(name, reason)| (name.as_str(), reason.as_str()))
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn StorageBackend>> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Validate requested names against the configuration; `all` or an empty
/// list selects everything.
fn select(config: &Config, names: &[String]) -> Result<Vec<String>> {
    if names.is_empty() || names.iter().any(|n| n == ALL_BACKENDS) {
        if config.backends.is_empty() {
            return Err(BackupError::Configuration(
                "no backends configured".to_string(),
            ));
        }
        return Ok(config.backends.keys().cloned().collect());
    }

    let mut selected = Vec::new();
    for name in names {
        if !config.backends.contains_key(name) {
            return Err(BackupError::Configuration(format!(
                "backend '{}' is not configured (known: {})",
                name,
                config.backends.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }
    Ok(selected)
}

async fn build(
    name: &str,
    backend_config: &BackendConfig,
    config: &Config,
) -> Result<Arc<dyn StorageBackend>> {
    let transfer = &config.transfer;
    Ok(match backend_config {
        BackendConfig::S3(settings) => Arc::new(S3Backend::connect(name, settings, transfer).await?),
        BackendConfig::Gcs(settings) => Arc::new(GcsBackend::connect(name, settings, transfer).await?),
        BackendConfig::Gdrive(settings) => {
            Arc::new(GDriveBackend::connect(name, settings, transfer).await?)
        }
        BackendConfig::Local(settings) => Arc::new(LocalBackend::new(
            name,
            settings,
            RetryPolicy::from_config(transfer),
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_locals(dir: &std::path::Path) -> Config {
        Config::from_toml_str(&format!(
            r#"
            [backends.nas]
            kind = "local"
            path = "{0}/nas"

            [backends.usb]
            kind = "local"
            path = "{0}/usb"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_selects_every_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_with_locals(dir.path());

        let registry = BackendRegistry::from_config(&config, &["all".to_string()])
            .await
            .unwrap();
        assert_eq!(registry.names(), vec!["nas", "usb"]);
        assert_eq!(registry.get("usb").unwrap().kind(), "local");
    }

    #[tokio::test]
    async fn test_unknown_backend_is_configuration_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_with_locals(dir.path());

        let result = BackendRegistry::from_config(&config, &["s3".to_string()]).await;
        assert!(matches!(result, Err(BackupError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_duplicate_names_resolve_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_with_locals(dir.path());

        let registry =
            BackendRegistry::from_config(&config, &["nas".to_string(), "nas".to_string()])
                .await
                .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("usb").is_err());
    }

    #[tokio::test]
    async fn test_broken_cloud_backend_does_not_hide_local_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::from_toml_str(&format!(
            r#"
            [backends.nas]
            kind = "local"
            path = "{0}/nas"

            [backends.cloud]
            kind = "gcs"
            credentials_file = "{0}/missing-key.json"
            "#,
            dir.path().display()
        ))
        .unwrap();

        let registry = BackendRegistry::from_config(&config, &[]).await.unwrap();
        assert_eq!(registry.names(), vec!["nas"]);
        let unavailable: Vec<_> = registry.unavailable().collect();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].0, "cloud");
        assert!(matches!(
            registry.get("cloud"),
            Err(BackupError::Provisioning(_))
        ));
    }

    #[tokio::test]
    async fn test_only_broken_backend_fails_the_call() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::from_toml_str(&format!(
            r#"
            [backends.cloud]
            kind = "gcs"
            credentials_file = "{0}/missing-key.json"
            "#,
            dir.path().display()
        ))
        .unwrap();

        let result = BackendRegistry::from_config(&config, &["cloud".to_string()]).await;
        assert!(matches!(result, Err(BackupError::CredentialsMissing(_))));
    }
}
