//! Google OAuth and the resumable upload protocol, shared by the Cloud
//! Storage and Drive backends.
//!
//! Credentials are exchanged for an access token once, when the backend is
//! constructed. There is no refresh during a run.

use crate::transfer::{logging_callback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

pub const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Resumable chunks must be a multiple of this, except the last one.
pub const CHUNK_ALIGNMENT: usize = 256 * 1024;

const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Fields of a service account key file that the JWT grant needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GoogleCredentials {
    ServiceAccount(ServiceAccountKey),
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    /// Pre-minted token (e.g. from `gcloud auth print-access-token`)
    AccessToken(String),
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl GoogleCredentials {
    /// Service account for Cloud Storage: explicit key file, then
    /// `GOOGLE_APPLICATION_CREDENTIALS_JSON`, `GOOGLE_APPLICATION_CREDENTIALS`,
    /// and finally `GOOGLE_OAUTH_ACCESS_TOKEN`.
    pub fn for_storage(credentials_file: Option<&Path>) -> Result<Self> {
        Self::for_storage_with(credentials_file, |key| std::env::var(key).ok())
    }

    fn for_storage_with(
        credentials_file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(path) = credentials_file {
            return Self::service_account_file(path);
        }
        if let Some(json) = env("GOOGLE_APPLICATION_CREDENTIALS_JSON") {
            return Self::service_account_json(&json);
        }
        if let Some(path) = env("GOOGLE_APPLICATION_CREDENTIALS") {
            return Self::service_account_file(&PathBuf::from(path));
        }
        if let Some(token) = env("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok(GoogleCredentials::AccessToken(token));
        }
        Err(BackupError::CredentialsMissing(
            "set credentials_file, GOOGLE_APPLICATION_CREDENTIALS(_JSON) or GOOGLE_OAUTH_ACCESS_TOKEN"
                .to_string(),
        ))
    }

    /// Drive accepts a service account key file or a user refresh token
    /// (from settings or `GOOGLE_DRIVE_REFRESH_TOKEN` +
    /// `GOOGLE_OAUTH_CLIENT_ID`/`GOOGLE_OAUTH_CLIENT_SECRET`).
    pub fn for_drive(
        credentials_file: Option<&Path>,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<Self> {
        Self::for_drive_with(
            credentials_file,
            client_id,
            client_secret,
            refresh_token,
            |key| std::env::var(key).ok(),
        )
    }

    fn for_drive_with(
        credentials_file: Option<&Path>,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        refresh_token: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(path) = credentials_file {
            return Self::service_account_file(path);
        }

        let client_id = client_id
            .map(str::to_string)
            .or_else(|| env("GOOGLE_OAUTH_CLIENT_ID"));
        let client_secret = client_secret
            .map(str::to_string)
            .or_else(|| env("GOOGLE_OAUTH_CLIENT_SECRET"));
        let refresh_token = refresh_token
            .map(str::to_string)
            .or_else(|| env("GOOGLE_DRIVE_REFRESH_TOKEN"));

        if let (Some(client_id), Some(client_secret), Some(refresh_token)) =
            (client_id, client_secret, refresh_token)
        {
            return Ok(GoogleCredentials::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            });
        }

        if let Some(token) =
            env("GOOGLE_OAUTH_ACCESS_TOKEN").or_else(|| env("GOOGLE_DRIVE_ACCESS_TOKEN"))
        {
            return Ok(GoogleCredentials::AccessToken(token));
        }

        Err(BackupError::CredentialsMissing(
            "Drive needs GOOGLE_DRIVE_REFRESH_TOKEN, GOOGLE_OAUTH_CLIENT_ID and GOOGLE_OAUTH_CLIENT_SECRET"
                .to_string(),
        ))
    }

    fn service_account_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BackupError::CredentialsMissing(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::service_account_json(&json)
    }

    fn service_account_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map(GoogleCredentials::ServiceAccount)
            .map_err(|e| BackupError::CredentialsMissing(format!("invalid service account key: {}", e)))
    }

    /// Project of a service account key, used when creating buckets
    pub fn project_id(&self) -> Option<&str> {
        match self {
            GoogleCredentials::ServiceAccount(key) => key.project_id.as_deref(),
            _ => None,
        }
    }

    /// Exchange the credentials for a bearer token.
    pub async fn access_token(&self, client: &Client, scope: &str) -> Result<String> {
        let request = match self {
            GoogleCredentials::AccessToken(token) => return Ok(token.clone()),
            GoogleCredentials::ServiceAccount(key) => {
                let assertion = signed_assertion(key, scope)?;
                client
                    .post(key.token_uri.as_deref().unwrap_or(TOKEN_URI))
                    .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            }
            GoogleCredentials::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            } => client.post(TOKEN_URI).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ]),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                BackupError::Transfer(format!("token endpoint returned {}: {}", status, body))
            } else {
                BackupError::CredentialsMissing(format!("token request rejected ({}): {}", status, body))
            });
        }

        let token: TokenResponse = response.json().await?;
        debug!("Obtained Google access token");
        Ok(token.access_token)
    }
}

fn signed_assertion(key: &ServiceAccountKey, scope: &str) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        iss: &key.client_email,
        scope,
        aud: key.token_uri.as_deref().unwrap_or(TOKEN_URI),
        iat: now,
        exp: now + TOKEN_LIFETIME_SECS,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| BackupError::CredentialsMissing(format!("invalid private key: {}", e)))?;

    encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
        .map_err(|e| BackupError::CredentialsMissing(format!("cannot sign token request: {}", e)))
}

/// HTTP client used for all Google API calls
pub fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| BackupError::Configuration(format!("HTTP client: {}", e)))
}

/// Translate a non-success API response into the error taxonomy.
pub async fn error_for(response: Response, context: &str) -> BackupError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(status, context, &body)
}

fn status_error(status: StatusCode, context: &str, body: &str) -> BackupError {
    let message = format!("{} ({}): {}", context, status, body.trim());
    match status {
        StatusCode::NOT_FOUND => BackupError::NotFound(message),
        StatusCode::UNAUTHORIZED => BackupError::CredentialsMissing(message),
        StatusCode::FORBIDDEN => BackupError::Provisioning(message),
        _ => BackupError::Transfer(message),
    }
}

/// Stream a successful media response into `dest`.
pub async fn save_response(response: Response, dest: &Path, label: &str) -> Result<u64> {
    let total = response.content_length().unwrap_or(0);
    let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    let mut stream = ProgressStream::new(body, logging_callback(label, total));
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BackupError::Transfer(format!("{}: {}", label, e)))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.sync_all().await?;

    if total > 0 && written != total {
        return Err(BackupError::Transfer(format!(
            "{}: expected {} bytes, received {}",
            label, total, written
        )));
    }
    Ok(written)
}

/// Round a configured chunk size down to the protocol alignment.
pub fn aligned_chunk_size(chunk_size: usize) -> usize {
    (chunk_size / CHUNK_ALIGNMENT).max(1) * CHUNK_ALIGNMENT
}

/// Open a resumable session. `start` is the service-specific initiation
/// request; the session URI comes back in `Location`.
pub async fn start_session(start: RequestBuilder, total: u64, context: &str) -> Result<String> {
    let response = start
        .header("X-Upload-Content-Length", total)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(error_for(response, context).await);
    }

    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| BackupError::Transfer(format!("{}: no session URI returned", context)))
}

/// Send `local` to an open session in aligned chunks. A chunk the server
/// does not acknowledge fails the whole upload with `Transfer`.
pub async fn upload_chunks(
    client: &Client,
    session_uri: &str,
    local: &Path,
    chunk_size: usize,
    label: &str,
) -> Result<serde_json::Value> {
    let mut file = tokio::fs::File::open(local).await?;
    let total = file.metadata().await?.len();
    let chunk_size = aligned_chunk_size(chunk_size) as u64;
    let progress = logging_callback(label, total);

    if total == 0 {
        let response = client
            .put(session_uri)
            .header(CONTENT_RANGE, "bytes */0")
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        return finish(response, label).await;
    }

    let mut offset = 0u64;
    loop {
        let len = chunk_size.min(total - offset);
        let mut chunk = Vec::with_capacity(len as usize);
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        (&mut file).take(len).read_to_end(&mut chunk).await?;
        if chunk.len() as u64 != len {
            return Err(BackupError::Transfer(format!(
                "{} changed size during upload",
                local.display()
            )));
        }

        let end = offset + len - 1;
        let response = client
            .put(session_uri)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total))
            .header(CONTENT_LENGTH, len)
            .body(chunk)
            .send()
            .await?;

        if response.status().as_u16() == 308 {
            offset = persisted_offset(&response).unwrap_or(end + 1);
            progress(offset);
            if offset >= total {
                return Err(BackupError::Transfer(format!(
                    "{}: server acknowledged all bytes without completing",
                    label
                )));
            }
            continue;
        }

        progress(total);
        return finish(response, label).await;
    }
}

/// Send a small payload to an open session in one request.
pub async fn upload_bytes(
    client: &Client,
    session_uri: &str,
    data: Vec<u8>,
    label: &str,
) -> Result<serde_json::Value> {
    let total = data.len();
    let range = if total == 0 {
        "bytes */0".to_string()
    } else {
        format!("bytes 0-{}/{}", total - 1, total)
    };
    let response = client
        .put(session_uri)
        .header(CONTENT_RANGE, range)
        .header(CONTENT_LENGTH, total)
        .body(data)
        .send()
        .await?;
    finish(response, label).await
}

async fn finish(response: Response, label: &str) -> Result<serde_json::Value> {
    if !response.status().is_success() {
        return Err(error_for(response, label).await);
    }
    let body = response.json::<serde_json::Value>().await.unwrap_or_default();
    info!("{}: resumable upload finished", label);
    Ok(body)
}

/// Next byte to send, from a 308 `Range: bytes=0-N` header.
fn persisted_offset(response: &Response) -> Option<u64> {
    parse_range_end(response.headers().get(RANGE)?.to_str().ok()?).map(|n| n + 1)
}

fn parse_range_end(range: &str) -> Option<u64> {
    range.strip_prefix("bytes=")?.split('-').nth(1)?.trim().parse().ok()
}
