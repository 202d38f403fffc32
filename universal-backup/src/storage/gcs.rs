//! Google Cloud Storage via the JSON API.

use super::google::{self, GoogleCredentials, STORAGE_SCOPE};
use super::{object_key, strip_object_key, with_retry, RetryPolicy, StorageBackend, StoredBlob};
use crate::config::{GcsSettings, TransferConfig};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

pub struct GcsBackend {
    name: String,
    settings: GcsSettings,
    project_id: Option<String>,
    client: Client,
    token: String,
    chunk_size: usize,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    /// The JSON API encodes uint64 as a string
    #[serde(default)]
    size: Option<String>,
    updated: Option<DateTime<Utc>>,
    storage_class: Option<String>,
}

impl GcsBackend {
    /// Resolve credentials and obtain an access token.
    pub async fn connect(
        name: impl Into<String>,
        settings: &GcsSettings,
        transfer: &TransferConfig,
    ) -> Result<Self> {
        let credentials = GoogleCredentials::for_storage(settings.credentials_file.as_deref())?;
        let client = google::http_client()?;
        let retry = RetryPolicy::from_config(transfer);
        let token = with_retry(&retry, "token exchange", || {
            credentials.access_token(&client, STORAGE_SCOPE)
        })
        .await?;
        let project_id = settings
            .project_id
            .clone()
            .or_else(|| credentials.project_id().map(str::to_string));

        Ok(Self {
            name: name.into(),
            settings: settings.clone(),
            project_id,
            client,
            token,
            chunk_size: transfer.chunk_size_bytes(),
            retry,
        })
    }

    fn key(&self, remote_name: &str) -> String {
        object_key(self.settings.prefix.as_deref(), remote_name)
    }

    fn bucket_url(&self) -> String {
        format!("{}/b/{}", API_BASE, self.settings.bucket)
    }

    /// `.../o/{object}` with the object name encoded as one path segment
    fn object_url(&self, remote_name: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/o", self.bucket_url()))
            .map_err(|e| BackupError::Configuration(format!("bad bucket URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BackupError::Configuration("bucket URL cannot take a path".into()))?
            .push(&self.key(remote_name));
        Ok(url)
    }

    async fn get_object(&self, remote_name: &str) -> Result<Option<reqwest::Response>> {
        let response = self
            .client
            .get(self.object_url(remote_name)?)
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response)),
            _ => Err(google::error_for(response, "GCS download").await),
        }
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "gcs"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn ensure_container(&self) -> Result<()> {
        let response = self
            .client
            .get(self.bucket_url())
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(backend = %self.name, bucket = %self.settings.bucket, "Bucket exists");
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(google::error_for(response, "GCS bucket lookup").await);
        }

        let project = self.project_id.as_deref().ok_or_else(|| {
            BackupError::Provisioning(format!(
                "bucket {} does not exist and no project_id is configured to create it",
                self.settings.bucket
            ))
        })?;

        let response = self
            .client
            .post(format!("{}/b", API_BASE))
            .query(&[("project", project)])
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": self.settings.bucket,
                "location": self.settings.location,
                "storageClass": self.settings.storage_class,
            }))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!(backend = %self.name, bucket = %self.settings.bucket, "Created GCS bucket");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                let body = response.text().await.unwrap_or_default();
                Err(BackupError::Provisioning(format!(
                    "cannot create bucket {}: {}",
                    self.settings.bucket, body
                )))
            }
            _ => Err(google::error_for(response, "GCS bucket creation").await),
        }
    }

    async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()> {
        let key = self.key(remote_name);
        let total = tokio::fs::metadata(local).await?.len();

        let start = self
            .client
            .post(format!("{}/b/{}/o", UPLOAD_BASE, self.settings.bucket))
            .query(&[("uploadType", "resumable"), ("name", key.as_str())])
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": key,
                "storageClass": self.settings.storage_class,
            }));
        let session = google::start_session(start, total, "GCS upload").await?;

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
        let key = self.key(remote_name);
        let response = self
            .client
            .post(format!("{}/b/{}/o", UPLOAD_BASE, self.settings.bucket))
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(google::error_for(response, "GCS put").await);
        }
        Ok(())
    }

    async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let response = self
            .get_object(remote_name)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("gs://{}/{}", self.settings.bucket, self.key(remote_name))))?;
        google::save_response(response, dest, &format!("{} download", self.name)).await?;
        Ok(())
    }

    async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>> {
        match self.get_object(remote_name).await? {
            Some(response) => Ok(Some(response.bytes().await?.to_vec())),
            None => Ok(None),
        }
    }

    async fn list_objects(&self) -> Result<Vec<StoredBlob>> {
        let prefix = self.settings.prefix.as_deref();
        let list_prefix = object_key(prefix, "");
        let mut blobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/o", self.bucket_url()))
                .bearer_auth(&self.token)
                .query(&[("prefix", list_prefix.as_str())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(google::error_for(response, "GCS list").await);
            }
            let page: ObjectList = response.json().await?;

            for object in page.items {
                let Some(name) = strip_object_key(prefix, &object.name) else {
                    continue;
                };
                blobs.push(StoredBlob {
                    name: name.to_string(),
                    size: object.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                    last_modified: object.updated.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    storage_class: object.storage_class,
                });
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(blobs)
    }

    async fn delete_object(&self, remote_name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(remote_name)?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(google::error_for(response, "GCS delete").await);
        }
        Ok(())
    }
}
