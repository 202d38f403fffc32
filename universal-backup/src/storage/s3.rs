//! S3 and S3-compatible object stores (MinIO, Wasabi, Backblaze B2).

use super::{object_key, strip_object_key, RetryPolicy, StorageBackend, StoredBlob};
use crate::config::{S3Settings, TransferConfig};
use crate::transfer::logging_callback;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    StorageClass,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Smallest part S3 accepts (except the last one)
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Highest part number a multipart upload may use
const MAX_PARTS: u64 = 10_000;

const MIB: u64 = 1024 * 1024;

/// Environment markers that the default AWS provider chain can resolve.
const AWS_CREDENTIAL_ENV: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_PROFILE",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
];

pub struct S3Backend {
    name: String,
    client: Client,
    settings: S3Settings,
    part_size: usize,
    retry: RetryPolicy,
}

/// Where the client's credentials come from
#[derive(Debug, PartialEq, Eq)]
enum CredentialSource {
    Inline { access_key_id: String, secret_access_key: String },
    ProviderChain,
}

fn credential_source(
    settings: &S3Settings,
    env: impl Fn(&str) -> Option<String>,
    shared_file_exists: bool,
) -> Result<CredentialSource> {
    match (&settings.access_key_id, &settings.secret_access_key) {
        (Some(id), Some(secret)) => {
            return Ok(CredentialSource::Inline {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
            })
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(BackupError::CredentialsMissing(
                "access_key_id and secret_access_key must be set together".to_string(),
            ))
        }
        (None, None) => {}
    }

    if shared_file_exists || AWS_CREDENTIAL_ENV.iter().any(|key| env(key).is_some()) {
        Ok(CredentialSource::ProviderChain)
    } else {
        Err(BackupError::CredentialsMissing(
            "set access_key_id/secret_access_key or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY"
                .to_string(),
        ))
    }
}

fn shared_credentials_file_exists() -> bool {
    std::env::var_os("AWS_SHARED_CREDENTIALS_FILE")
        .map(std::path::PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| Path::new(&h).join(".aws/credentials")))
        .is_some_and(|p| p.exists())
}

/// Translate an SDK failure at the backend boundary.
fn sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> BackupError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{}: {}", context, DisplayErrorContext(&err));

    match (&err, status) {
        (SdkError::ConstructionFailure(_), _) => BackupError::Configuration(message),
        (_, Some(404)) => BackupError::NotFound(message),
        (_, Some(401 | 403)) => BackupError::CredentialsMissing(message),
        _ => BackupError::Transfer(message),
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl S3Backend {
    pub async fn connect(
        name: impl Into<String>,
        settings: &S3Settings,
        transfer: &TransferConfig,
    ) -> Result<Self> {
        let source = credential_source(
            settings,
            |key| std::env::var(key).ok(),
            shared_credentials_file_exists(),
        )?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let CredentialSource::Inline {
            access_key_id,
            secret_access_key,
        } = source
        {
            let creds = Credentials::new(access_key_id, secret_access_key, None, None, "universal-backup");
            loader = loader.credentials_provider(creds);
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            name: name.into(),
            client: Client::from_conf(builder.build()),
            settings: settings.clone(),
            part_size: transfer.chunk_size_bytes().max(MIN_PART_SIZE),
            retry: RetryPolicy::from_config(transfer),
        })
    }

    fn key(&self, remote_name: &str) -> String {
        object_key(self.settings.prefix.as_deref(), remote_name)
    }

    fn storage_class(&self) -> StorageClass {
        StorageClass::from(self.settings.storage_class.as_str())
    }

    async fn put_single(&self, local: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| BackupError::Transfer(format!("cannot read {}: {}", local.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .storage_class(self.storage_class())
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error("S3 put", e))?;
        Ok(())
    }

    /// Chunked upload; any failed part aborts the whole upload.
    async fn put_multipart(&self, local: &Path, key: &str, total: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .storage_class(self.storage_class())
            .send()
            .await
            .map_err(|e| sdk_error("S3 multipart start", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackupError::Transfer("S3 returned no upload id".to_string()))?
            .to_string();

        match self.upload_parts(local, key, &upload_id, total).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(backend = %self.name, key = %key, "Aborting multipart upload: {}", e);
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.settings.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(backend = %self.name, "Abort failed: {}", DisplayErrorContext(&abort));
                }
                Err(match e {
                    BackupError::Transfer(_) | BackupError::CredentialsMissing(_) => e,
                    other => BackupError::Transfer(other.to_string()),
                })
            }
        }
    }

    async fn upload_parts(&self, local: &Path, key: &str, upload_id: &str, total: u64) -> Result<()> {
        let part_size = part_size_for(self.part_size, total);
        if part_size != self.part_size {
            debug!(backend = %self.name, part_size, "Raised part size to stay within the part limit");
        }
        let mut file = tokio::fs::File::open(local).await?;
        let progress = logging_callback(format!("{} upload", self.name), total);
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1i32;

        loop {
            let mut buffer = Vec::with_capacity(part_size);
            (&mut file)
                .take(part_size as u64)
                .read_to_end(&mut buffer)
                .await?;
            if buffer.is_empty() {
                break;
            }
            let len = buffer.len() as u64;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| sdk_error(&format!("S3 part {}", part_number), e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(uploaded.e_tag().unwrap_or_default())
                    .build(),
            );
            sent += len;
            progress(sent);
            part_number += 1;
        }

        if sent != total {
            return Err(BackupError::Transfer(format!(
                "{} changed size during upload ({} of {} bytes)",
                local.display(),
                sent,
                total
            )));
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("S3 multipart complete", e))?;
        Ok(())
    }

    async fn get_body(&self, remote_name: &str) -> Result<Option<(ByteStream, u64)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(self.key(remote_name))
            .send()
            .await;

        match result {
            Ok(output) => {
                let length = output.content_length().unwrap_or(0).max(0) as u64;
                Ok(Some((output.body, length)))
            }
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => Ok(None),
            Err(e) => match sdk_error("S3 get", e) {
                BackupError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "s3"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn ensure_container(&self) -> Result<()> {
        let head = self
            .client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await;

        match head {
            Ok(_) => {
                debug!(backend = %self.name, bucket = %self.settings.bucket, "Bucket exists");
                return Ok(());
            }
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {}
            Err(e) => {
                let err = sdk_error("S3 head bucket", e);
                if !err.is_not_found() {
                    return Err(err);
                }
            }
        }

        let mut create = self.client.create_bucket().bucket(&self.settings.bucket);
        if self.settings.region != "us-east-1" {
            let constraint = BucketLocationConstraint::from(self.settings.region.as_str());
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(constraint)
                    .build(),
            );
        }

        match create.send().await {
            Ok(_) => {
                info!(backend = %self.name, bucket = %self.settings.bucket, "Created S3 bucket");
                Ok(())
            }
            Err(e) if e
                .as_service_error()
                .is_some_and(|s| s.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(BackupError::Provisioning(format!(
                "cannot create bucket {}: {}",
                self.settings.bucket,
                DisplayErrorContext(&e)
            ))),
        }
    }

    async fn put_file(&self, local: &Path, remote_name: &str) -> Result<()> {
        let key = self.key(remote_name);
        let total = tokio::fs::metadata(local).await?.len();

        if total as usize <= self.part_size {
            self.put_single(local, &key).await
        } else {
            self.put_multipart(local, &key, total).await
        }
    }

    async fn put_bytes(&self, remote_name: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(self.key(remote_name))
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("S3 put", e))?;
        Ok(())
    }

    async fn fetch_file(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let (mut body, total) = self.get_body(remote_name).await?.ok_or_else(|| {
            BackupError::NotFound(format!("s3://{}/{}", self.settings.bucket, self.key(remote_name)))
        })?;

        let progress = logging_callback(format!("{} download", self.name), total);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| BackupError::Transfer(format!("S3 download: {}", e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written);
        }
        file.sync_all().await?;

        if total > 0 && written != total {
            return Err(BackupError::Transfer(format!(
                "S3 download truncated: {} of {} bytes",
                written, total
            )));
        }
        Ok(())
    }

    async fn fetch_bytes(&self, remote_name: &str) -> Result<Option<Vec<u8>>> {
        let Some((body, _)) = self.get_body(remote_name).await? else {
            return Ok(None);
        };
        let bytes = body
            .collect()
            .await
            .map_err(|e| BackupError::Transfer(format!("S3 read: {}", e)))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn list_objects(&self) -> Result<Vec<StoredBlob>> {
        let prefix = self.settings.prefix.as_deref();
        let list_prefix = object_key(prefix, "");
        let mut blobs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.settings.bucket)
                .prefix(&list_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_error("S3 list", e))?;

            for object in page.contents() {
                let Some(name) = object.key().and_then(|k| strip_object_key(prefix, k)) else {
                    continue;
                };
                blobs.push(StoredBlob {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .map(to_chrono)
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    storage_class: object.storage_class().map(|c| c.as_str().to_string()),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }

        Ok(blobs)
    }

    async fn delete_object(&self, remote_name: &str) -> Result<()> {
        let key = self.key(remote_name);

        // DeleteObject succeeds for missing keys, so check with HeadObject first.
        let head = self
            .client
            .head_object()
            .bucket(&self.settings.bucket)
            .key(&key)
            .send()
            .await;
        match head {
            Ok(_) => {}
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {
                return Err(BackupError::NotFound(format!(
                    "s3://{}/{}",
                    self.settings.bucket, key
                )))
            }
            Err(e) => return Err(sdk_error("S3 head object", e)),
        }

        self.client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| sdk_error("S3 delete", e))?;
        Ok(())
    }
}

/// Configured part size, grown to a whole MiB when `total` would otherwise
/// need more than [`MAX_PARTS`] parts.
fn part_size_for(configured: usize, total: u64) -> usize {
    let needed = total.div_ceil(MAX_PARTS).div_ceil(MIB) * MIB;
    configured.max(needed as usize)
}
