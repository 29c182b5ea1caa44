//! Google capabilities: OAuth tokens, Drive folder lookup and Drive
//! multipart upload.
//!
//! Silent authentication uses a refresh-token grant.  Interactive and
//! consent prompts run the OAuth device-authorization flow; the user code
//! and verification URL are surfaced as notifications.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use memo_common::config::GoogleConfig;
use memo_common::protocol::{Destination, NoticeLevel};

use crate::credentials::{AuthError, PromptMode, TokenGrant, TokenProvider, DRIVE_FILE_SCOPE};
use crate::feedback::Feedback;
use crate::upload::{FolderPicker, PickError, PickOutcome, UploadError, UploadReceipt, UploadRequest, Uploader};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEVICE_CODE_URL: &str = "https://oauth2.googleapis.com/device/code";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Extra wait added on every `slow_down` answer.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// One client for all Google endpoints.
pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Cannot create HTTP client")
}

// ── OAuth ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_url: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// What to do after a device-flow poll came back with an error code.
#[derive(Debug, PartialEq, Eq)]
enum PollStep {
    Wait,
    SlowDown,
    Abort(String),
}

fn classify_poll_error(body: &OAuthErrorBody) -> PollStep {
    match body.error.as_str() {
        "authorization_pending" => PollStep::Wait,
        "slow_down" => PollStep::SlowDown,
        "access_denied" => PollStep::Abort("access denied by user".into()),
        "expired_token" => PollStep::Abort("device code expired before approval".into()),
        other => PollStep::Abort(match &body.error_description {
            Some(desc) => format!("{other}: {desc}"),
            None => other.to_string(),
        }),
    }
}

pub struct GoogleAuth {
    client: Client,
    client_id: String,
    client_secret: Option<String>,
    refresh_token: Mutex<Option<String>>,
    feedback: Feedback,
}

impl GoogleAuth {
    pub fn new(client: Client, config: &GoogleConfig, feedback: Feedback) -> Self {
        Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: Mutex::new(config.refresh_token.clone()),
            feedback,
        }
    }

    fn refresh_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.refresh_token.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("client_id", self.client_id.clone())];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.clone()));
        }
        params
    }

    fn grant(&self, response: TokenResponse) -> TokenGrant {
        if let Some(refresh) = response.refresh_token {
            debug!("Keeping new refresh token");
            *self.refresh_slot() = Some(refresh);
        }
        TokenGrant {
            access_token: response.access_token,
            expires_in: Duration::from_secs(response.expires_in),
        }
    }

    async fn refresh(&self) -> Result<TokenGrant, AuthError> {
        let refresh_token = self
            .refresh_slot()
            .clone()
            .ok_or_else(|| AuthError::Failed("no refresh token for silent sign-in".into()))?;

        let mut params = self.client_params();
        params.push(("refresh_token", refresh_token));
        params.push(("grant_type", "refresh_token".into()));

        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Failed(format!("token endpoint unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body: Option<OAuthErrorBody> = resp.json().await.ok();
            if body.as_ref().is_some_and(|b| b.error == "invalid_grant") {
                warn!("Refresh token revoked – dropping it");
                *self.refresh_slot() = None;
            }
            return Err(AuthError::Failed(format!(
                "refresh grant returned {status}{}",
                body.map(|b| format!(" ({})", b.error)).unwrap_or_default()
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Failed(format!("bad token response: {e}")))?;
        info!("Access token refreshed");
        Ok(self.grant(token))
    }

    async fn device_flow(&self) -> Result<TokenGrant, AuthError> {
        let params = [
            ("client_id", self.client_id.clone()),
            ("scope", DRIVE_FILE_SCOPE.to_string()),
        ];

        let resp = self
            .client
            .post(DEVICE_CODE_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Failed(format!("device endpoint unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(AuthError::Failed(format!("device code request returned {}", resp.status())));
        }
        let device: DeviceCodeResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Failed(format!("bad device code response: {e}")))?;

        self.feedback.notify(
            NoticeLevel::Info,
            format!("To sign in, visit {} and enter code {}", device.verification_url, device.user_code),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval);

        let mut poll = self.client_params();
        poll.push(("device_code", device.device_code));
        poll.push(("grant_type", DEVICE_GRANT.to_string()));

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Failed("device code expired before approval".into()));
            }

            let resp = self
                .client
                .post(TOKEN_URL)
                .form(&poll)
                .send()
                .await
                .map_err(|e| AuthError::Failed(format!("token endpoint unreachable: {e}")))?;

            if resp.status().is_success() {
                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| AuthError::Failed(format!("bad token response: {e}")))?;
                info!("Device authorization approved");
                return Ok(self.grant(token));
            }

            let status = resp.status();
            let body: OAuthErrorBody = resp
                .json()
                .await
                .map_err(|e| AuthError::Failed(format!("token poll returned {status}: {e}")))?;
            match classify_poll_error(&body) {
                PollStep::Wait => debug!("Waiting for device approval"),
                PollStep::SlowDown => {
                    interval += SLOW_DOWN_STEP;
                    debug!("Device poll slowed to {}s", interval.as_secs());
                }
                PollStep::Abort(reason) => return Err(AuthError::Failed(reason)),
            }
        }
    }
}

#[async_trait]
impl TokenProvider for GoogleAuth {
    async fn request_token(&self, prompt: PromptMode) -> Result<TokenGrant, AuthError> {
        match prompt {
            PromptMode::Silent => self.refresh().await,
            PromptMode::Interactive => {
                if self.refresh_slot().is_some() {
                    match self.refresh().await {
                        Ok(grant) => return Ok(grant),
                        Err(e) => debug!("Silent refresh failed, falling back to device flow: {e}"),
                    }
                }
                self.device_flow().await
            }
            PromptMode::Consent => {
                *self.refresh_slot() = None;
                self.device_flow().await
            }
        }
    }
}

// ── Drive folders ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Quote a value for the Drive `q` query language.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn folder_query(name: &str) -> String {
    format!(
        "mimeType = '{FOLDER_MIME}' and trashed = false and name = '{}'",
        escape_query(name)
    )
}

/// Drive ids are long runs of URL-safe characters.
fn looks_like_id(query: &str) -> bool {
    query.len() >= 20 && query.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub struct DriveFolderPicker {
    client: Client,
}

impl DriveFolderPicker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, access_token: &str, url: Url) -> Result<Option<reqwest::Response>, PickError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| PickError::Failed(format!("Drive unreachable: {e}")))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(PickError::Unauthorized),
            StatusCode::NOT_FOUND => Ok(None),
            s if !s.is_success() => Err(PickError::Failed(format!("Drive returned {s}"))),
            _ => Ok(Some(resp)),
        }
    }

    async fn by_name(&self, access_token: &str, name: &str) -> Result<Option<DriveFile>, PickError> {
        let url = Url::parse_with_params(
            FILES_URL,
            &[
                ("q", folder_query(name).as_str()),
                ("fields", "files(id,name)"),
                ("pageSize", "10"),
                ("orderBy", "modifiedTime desc"),
            ],
        )
        .map_err(|e| PickError::Failed(e.to_string()))?;
        let Some(resp) = self.get(access_token, url).await? else {
            return Ok(None);
        };
        let list: FileList = resp
            .json()
            .await
            .map_err(|e| PickError::Failed(format!("bad folder listing: {e}")))?;
        if list.files.len() > 1 {
            debug!("{} folders named {name:?} – taking the most recent", list.files.len());
        }
        Ok(list.files.into_iter().next())
    }

    async fn by_id(&self, access_token: &str, id: &str) -> Result<Option<DriveFile>, PickError> {
        let url = Url::parse_with_params(&format!("{FILES_URL}/{id}"), &[("fields", "id,name,mimeType")])
            .map_err(|e| PickError::Failed(e.to_string()))?;
        let Some(resp) = self.get(access_token, url).await? else {
            return Ok(None);
        };
        let file: DriveFile = resp
            .json()
            .await
            .map_err(|e| PickError::Failed(format!("bad file metadata: {e}")))?;
        Ok((file.mime_type.as_deref() == Some(FOLDER_MIME)).then_some(file))
    }
}

#[async_trait]
impl FolderPicker for DriveFolderPicker {
    async fn pick(&self, access_token: &str, query: &str) -> Result<PickOutcome, PickError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(PickOutcome::Cancelled);
        }
        let mut found = self.by_name(access_token, query).await?;
        if found.is_none() && looks_like_id(query) {
            found = self.by_id(access_token, query).await?;
        }
        Ok(match found {
            Some(file) => {
                info!("Picked Drive folder {} ({})", file.name, file.id);
                PickOutcome::Picked(Destination {
                    id: file.id,
                    name: file.name,
                })
            }
            None => {
                info!("No Drive folder matches {query:?}");
                PickOutcome::Cancelled
            }
        })
    }
}

// ── Drive upload ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

pub struct DriveUploader {
    client: Client,
}

impl DriveUploader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn upload_form(request: &UploadRequest) -> Result<Form, reqwest::Error> {
    let metadata = json!({
        "name": request.file_name,
        "mimeType": request.mime_type,
        "parents": [request.parent],
    });
    let metadata = Part::text(metadata.to_string()).mime_str("application/json; charset=UTF-8")?;
    let file = Part::bytes(request.payload.to_vec())
        .file_name(request.file_name.clone())
        .mime_str(&request.mime_type)?;
    Ok(Form::new().part("metadata", metadata).part("file", file))
}

#[async_trait]
impl Uploader for DriveUploader {
    async fn upload(&self, access_token: &str, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        let form = upload_form(&request).map_err(|e| UploadError::Network(format!("cannot build upload: {e}")))?;

        let resp = self
            .client
            .post(UPLOAD_URL)
            .bearer_auth(access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(UploadError::Unauthorized),
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                warn!("Drive upload of {} returned {s}: {}", request.file_name, body.trim());
                Err(UploadError::Rejected { status: s.as_u16() })
            }
            _ => {
                let file: UploadedFile = resp
                    .json()
                    .await
                    .map_err(|e| UploadError::Network(format!("bad upload response: {e}")))?;
                info!("Drive upload complete: {} → {}", request.file_name, file.id);
                Ok(UploadReceipt { file_id: file.id })
            }
        }
    }
}
