//! Google Drive folder storage (Drive API v3).
//!
//! Drive addresses files by id, not by name, so every name-based operation
//! first looks the file up inside the backup folder.

use super::google::{self, GoogleCredentials, DRIVE_SCOPE};
use super::{with_retry, RetryPolicy, StorageBackend, StoredBlob};
use crate::config::{GDriveSettings, TransferConfig};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const DEFAULT_FOLDER: &str = "ServerBackups";
const FILE_FIELDS: &str = "nextPageToken, files(id, name, size, modifiedTime)";

pub struct GDriveBackend {
    name: String,
    folder_name: String,
    shared_drive_id: Option<String>,
    client: Client,
    token: String,
    chunk_size: usize,
    retry: RetryPolicy,
    folder_id: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    modified_time: Option<DateTime<Utc>>,
}

/// Quote a value for a Drive `q` expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl GDriveBackend {
    pub async fn connect(
        name: impl Into<String>,
        settings: &GDriveSettings,
        transfer: &TransferConfig,
    ) -> Result<Self> {
        let credentials = GoogleCredentials::for_drive(
            settings.credentials_file.as_deref(),
            settings.client_id.as_deref(),
            settings.client_secret.as_deref(),
            settings.refresh_token.as_deref(),
        )?;
        let client = google::http_client()?;
        let retry = RetryPolicy::from_config(transfer);
        let token = with_retry(&retry, "token exchange", || {
            credentials.access_token(&client, DRIVE_SCOPE)
        })
        .await?;

        Ok(Self {
            name: name.into(),
            folder_name: settings
                .folder_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            shared_drive_id: settings.shared_drive_id.clone(),
            client,
            token,
            chunk_size: transfer.chunk_size_bytes(),
            retry,
            folder_id: OnceCell::new(),
        })
    }

    /// Shared-drive parameters every call needs
    fn scoped(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")]);
        match &self.shared_drive_id {
            Some(drive_id) => request.query(&[
                ("includeItemsFromAllDrives", "true"),
                ("corpora", "drive"),
                ("driveId", drive_id.as_str()),
            ]),
            None => request,
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .scoped(self.client.get(format!("{}/files", API_BASE)))
                .query(&[("q", query), ("fields", FILE_FIELDS), ("pageSize", "1000")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(google::error_for(response, "Drive search").await);
            }
            let page: FileList = response.json().await?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    async fn find_or_create_folder(&self) -> Result<String> {
        let query = format!(
            "name={} and mimeType='{}' and trashed=false",
            quote(&self.folder_name),
            FOLDER_MIME
        );
        if let Some(folder) = self.search(&query).await?.into_iter().next() {
            debug!(backend = %self.name, folder = %self.folder_name, id = %folder.id, "Using existing folder");
            return Ok(folder.id);
        }

        let mut metadata = serde_json::json!({
            "name": self.folder_name,
            "mimeType": FOLDER_MIME,
        });
        if let Some(drive_id) = &self.shared_drive_id {
            metadata["parents"] = serde_json::json!([drive_id]);
        }

        let response = self
            .client
            .post(format!("{}/files", API_BASE))
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true"), ("fields", "id")])
            .json(&metadata)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                let body = response.text().await.unwrap_or_default();
                return Err(BackupError::Provisioning(format!(
                    "cannot create Drive folder {}: {}",
                    self.folder_name, body
                )));
            }
            _ => return Err(google::error_for(response, "Drive folder creation").await),
        }

        let created: serde_json::Value = response.json().await?;
        let id = created["id"]
            .as_str()
            .ok_or_else(|| BackupError::Provisioning("Drive returned no folder id".to_string()))?
            .to_string();
        info!(backend = %self.name, folder = %self.folder_name, id = %id, "Created Drive folder");
        Ok(id)
    }

    async fn folder_id(&self) -> Result<&str> {
        self.folder_id
            .get_or_try_init(|| self.find_or_create_folder())
            .await
            .map(String::as_str)
    }

    async fn find_file(&self, remote_name: &str) -> Result<Option<DriveFile>> {
        let folder = self.folder_id().await?;
        let query = format!(
            "name={} and {} in parents and trashed=false",
            quote(remote_name),
            quote(folder)
        );
        Ok(self.search(&query).await?.into_iter().next())
    }

    /// Resumable session that creates `remote_name` or replaces its content.
    async fn open_session(&self, remote_name: &str, total: u64) -> Result<String> {
        let start = match self.find_file(remote_name).await? {
            Some(existing) => self
                .client
                .patch(format!("{}/files/{}", UPLOAD_BASE, existing.id))
                .json(&serde_json::json!({})),
            None => {
                let folder = self.folder_id().await?;
                self.client
                    .post(format!("{}/files", UPLOAD_BASE))
                    .json(&serde_json::json!({ "name": remote_name, "parents": [folder] }))
            }
        };
        let start = start
            .bearer_auth(&self.token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")]);

        google::start_session(start, total, "Drive upload").await
    }

    async fn download_response(&self, remote_name: &str) -> Result<Option<reqwest::Response>> {
        let Some(file) = self.find_file(remote_name).await? else {
            return Ok(None);
        };

        let response = self
            .client
            .get(format!("{}/files/{}", API_BASE, file.id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response)),
            _ => Err(google::error_for(response, "Drive download").await),
        }
    }
}

#[async_trait]
impl StorageBackend for GDriveBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "gdrive"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn ensure_container(&self) -> Result<()> {
        self.folder_id().await.map(|_| ())
    }

    async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()> {
        let total = tokio::fs::metadata(local).await?.len();
        let session = self.open_session(remote_name, total).await?;
        google::upload_chunks(
            &self.client,
            &session,
            local,
            self.chunk_size,
            &format!("{} upload", self.name),
        )
        .await?;
        Ok(())
    }

    async fn put_bytes(&self, remote_name: &str, data: Vec<u8>) -> Result<()> {
        let session = self.open_session(remote_name, data.len() as u64).await?;
        google::upload_bytes(&self.client, &session, data, remote_name).await?;
        Ok(())
    }

    async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let response = self.download_response(remote_name).await?.ok_or_else(|| {
            BackupError::NotFound(format!("{}/{}", self.folder_name, remote_name))
        })?;
        google::save_response(response, dest, &format!("{} download", self.name)).await?;
        Ok(())
    }

    async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>> {
        match self.download_response(remote_name).await? {
            Some(response) => Ok(Some(response.bytes().await?.to_vec())),
            None => Ok(None),
        }
    }

    async fn list_objects(&self) -> Result<Vec<StoredBlob>> {
        let folder = self.folder_id().await?;
        let query = format!("{} in parents and trashed=false", quote(folder));

        Ok(self
            .search(&query)
            .await?
            .into_iter()
            .map(|file| StoredBlob {
                name: file.name,
                size: file.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                last_modified: file.modified_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                storage_class: None,
            })
            .collect())
    }

    async fn delete_object(&self, remote_name: &str) -> Result<()> {
        let file = self.find_file(remote_name).await?.ok_or_else(|| {
            BackupError::NotFound(format!("{}/{}", self.folder_name, remote_name))
        })?;

        let response = self
            .client
            .delete(format!("{}/files/{}", API_BASE, file.id))
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(google::error_for(response, "Drive delete").await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_quoting() {
        assert_eq!(quote("backups"), "'backups'");
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_file_list_parsing() {
        let page: FileList = serde_json::from_str(
            r#"{"files":[{"id":"1","name":"a.img.zst","size":"42","modifiedTime":"2025-03-01T10:00:00.000Z"}],"nextPageToken":"t"}"#,
        )
        .unwrap();
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.files[0].size.as_deref(), Some("42"));
        assert_eq!(page.next_page_token.as_deref(), Some("t"));
    }

    #[test]
    fn test_folder_listing_without_files_field() {
        let page: FileList = serde_json::from_str("{}").unwrap();
        assert!(page.files.is_empty());
    }
}
