//! Upload pipeline – routes a finished recording to the cloud folder, a
//! deferred slot awaiting re-login, or a local download.
//!
//! Routing order for [`UploadPipeline::deliver`]:
//!
//! 1. no destination folder        → local download
//! 2. credential missing / expired → silent refresh, else deferred
//!    (auto-upload on) or local download
//! 3. upload fails                 → local download
//! 4. upload succeeds              → done, nothing written locally
//!
//! Only one recording is ever deferred.  It also gets a local copy straight
//! away, so nothing is lost if the user never logs in again.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use memo_common::protocol::{AuthBadge, Destination, NoticeLevel};
use memo_common::recording::{Payload, Recording};
use memo_common::store::{load_json, save_json, KeyValueStore, AUTO_UPLOAD_KEY, FOLDER_KEY};

use crate::credentials::{AuthContext, AuthError, CredentialManager, PromptMode};
use crate::delivery::LocalDelivery;
use crate::feedback::Feedback;

// ── capabilities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    /// Destination folder id.
    pub parent: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_id: String,
}

#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// The server rejected the credential (HTTP 401).
    #[error("credential rejected")]
    Unauthorized,

    #[error("upload rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, access_token: &str, request: UploadRequest) -> Result<UploadReceipt, UploadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    Picked(Destination),
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum PickError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("credential rejected by folder listing")]
    Unauthorized,

    #[error("folder selection failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait FolderPicker: Send + Sync {
    /// Resolve `query` to a folder.  `Cancelled` when nothing matches.
    async fn pick(&self, access_token: &str, query: &str) -> Result<PickOutcome, PickError>;
}

// ── pipeline ─────────────────────────────────────────────────────────────

/// Where a recording ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Uploaded(UploadReceipt),
    Downloaded(PathBuf),
    /// Waiting for re-login; `local_copy` is the safety-net download.
    Deferred { local_copy: Option<PathBuf> },
    /// The local write failed too.  The payload is still held by the
    /// catalog for a manual save.
    Undelivered,
}

/// The single recording waiting for the user to log in again.
#[derive(Debug, Clone)]
pub struct DeferredRecording {
    pub recording: Recording,
    pub local_copy: Option<PathBuf>,
}

pub struct UploadPipeline {
    credentials: CredentialManager,
    uploader: Arc<dyn Uploader>,
    picker: Arc<dyn FolderPicker>,
    local: Arc<dyn LocalDelivery>,
    store: Arc<dyn KeyValueStore>,
    feedback: Feedback,
    destination: Option<Destination>,
    auto_upload: bool,
    deferred: Option<DeferredRecording>,
}

impl UploadPipeline {
    /// Restore the persisted destination and auto-upload preference;
    /// `default_auto_upload` applies until the user toggles it.
    pub fn new(
        credentials: CredentialManager,
        uploader: Arc<dyn Uploader>,
        picker: Arc<dyn FolderPicker>,
        local: Arc<dyn LocalDelivery>,
        store: Arc<dyn KeyValueStore>,
        feedback: Feedback,
        default_auto_upload: bool,
    ) -> Self {
        let mut destination = load_json::<Destination>(store.as_ref(), FOLDER_KEY).unwrap_or_else(|e| {
            warn!("Cannot read destination folder: {e}");
            None
        });
        if destination.is_some() && !credentials.is_configured() {
            warn!("Cloud storage not configured – ignoring saved destination folder");
            destination = None;
        }
        let auto_upload = load_json::<bool>(store.as_ref(), AUTO_UPLOAD_KEY)
            .unwrap_or_else(|e| {
                warn!("Cannot read auto-upload preference: {e}");
                None
            })
            .unwrap_or(default_auto_upload);

        feedback.set_destination(destination.clone());
        feedback.set_auto_upload(auto_upload);
        feedback.set_auth(if credentials.check_validity() {
            AuthBadge::SignedIn
        } else {
            AuthBadge::SignedOut
        });
        if let Some(dest) = &destination {
            info!("Destination folder: {} ({})", dest.name, dest.id);
        }
        debug!("Credential state: {:?}", credentials.state());

        Self {
            credentials,
            uploader,
            picker,
            local,
            store,
            feedback,
            destination,
            auto_upload,
            deferred: None,
        }
    }

    #[cfg(test)]
    pub fn deferred(&self) -> Option<&DeferredRecording> {
        self.deferred.as_ref()
    }

    #[cfg(test)]
    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Route a finished recording.
    pub async fn deliver(&mut self, recording: Recording) -> Delivery {
        self.route(recording, None).await
    }

    /// `local_copy` is set when the recording already has a safety-net
    /// download, so a fallback does not write it twice.
    async fn route(&mut self, recording: Recording, local_copy: Option<PathBuf>) -> Delivery {
        let Some(destination) = self.destination.clone() else {
            self.feedback.notify(
                NoticeLevel::Info,
                format!("No destination folder selected – saving {} locally", recording.file_name()),
            );
            return self.fall_back(&recording, local_copy).await;
        };

        let token = if self.credentials.check_validity() {
            self.credentials.access_token()
        } else {
            None
        };
        let token = match token {
            Some(token) => Some(token),
            None => self.refresh_silently().await,
        };
        let Some(token) = token else {
            if self.auto_upload {
                return self.defer(recording, local_copy).await;
            }
            self.feedback.notify(
                NoticeLevel::Warning,
                format!("Not signed in – saving {} locally", recording.file_name()),
            );
            return self.fall_back(&recording, local_copy).await;
        };

        let request = UploadRequest {
            file_name: recording.file_name(),
            mime_type: recording.mime_type.clone(),
            parent: destination.id.clone(),
            payload: Arc::clone(&recording.payload),
        };
        debug!("Uploading {} ({} bytes) to {}", request.file_name, recording.size(), destination.id);
        self.feedback.set_status(format!("Uploading {}…", request.file_name), false);

        let result = self.uploader.upload(&token, request).await;
        self.feedback.set_status("Idle", false);

        match result {
            Ok(receipt) => {
                debug!("Stored as file {}", receipt.file_id);
                self.feedback.notify(
                    NoticeLevel::Success,
                    format!("Uploaded {} to {}", recording.file_name(), destination.name),
                );
                Delivery::Uploaded(receipt)
            }
            Err(UploadError::Unauthorized) => {
                self.credentials.invalidate();
                self.feedback.set_auth(AuthBadge::NeedsRelogin);
                self.feedback.notify(
                    NoticeLevel::Error,
                    format!("Upload refused: sign-in expired – saving {} locally", recording.file_name()),
                );
                self.fall_back(&recording, local_copy).await
            }
            Err(e) => {
                self.feedback.notify(
                    NoticeLevel::Error,
                    format!("Upload failed ({e}) – saving {} locally", recording.file_name()),
                );
                self.fall_back(&recording, local_copy).await
            }
        }
    }

    /// Try to renew the credential without involving the user.
    async fn refresh_silently(&mut self) -> Option<String> {
        match self
            .credentials
            .authenticate(PromptMode::Silent, AuthContext::Upload)
            .await
        {
            Ok(token) => {
                info!("Credential renewed silently");
                self.feedback.set_auth(AuthBadge::SignedIn);
                Some(token)
            }
            Err(e) => {
                debug!("Silent renewal failed: {e}");
                None
            }
        }
    }

    async fn fall_back(&self, recording: &Recording, local_copy: Option<PathBuf>) -> Delivery {
        if let Some(path) = local_copy {
            debug!("{} already saved at {}", recording.name, path.display());
            return Delivery::Downloaded(path);
        }
        match self.save_locally(recording).await {
            Some(path) => Delivery::Downloaded(path),
            None => Delivery::Undelivered,
        }
    }

    async fn save_locally(&self, recording: &Recording) -> Option<PathBuf> {
        match self.local.deliver(&recording.file_name(), &recording.payload).await {
            Ok(path) => {
                self.feedback.notify(NoticeLevel::Info, format!("Saved {}", path.display()));
                Some(path)
            }
            Err(e) => {
                self.feedback.notify(
                    NoticeLevel::Error,
                    format!("Cannot save {} locally: {e:#}", recording.file_name()),
                );
                None
            }
        }
    }

    async fn defer(&mut self, recording: Recording, local_copy: Option<PathBuf>) -> Delivery {
        if let Some(older) = self.deferred.take() {
            info!("Replacing deferred recording {}", older.recording.name);
            if older.local_copy.is_none() {
                self.save_locally(&older.recording).await;
            }
        }

        let local_copy = match local_copy {
            Some(path) => Some(path),
            None => self.save_locally(&recording).await,
        };
        self.feedback.set_auth(AuthBadge::NeedsRelogin);
        self.feedback.set_deferred(Some(recording.name.clone()));
        self.feedback.notify(
            NoticeLevel::Warning,
            format!(
                "Sign-in expired – {} kept locally; log in again to upload it",
                recording.file_name()
            ),
        );
        self.deferred = Some(DeferredRecording {
            recording,
            local_copy: local_copy.clone(),
        });
        Delivery::Deferred { local_copy }
    }

    /// Re-deliver the deferred recording, clearing the slot first.
    async fn resume_deferred(&mut self) -> Option<Delivery> {
        let deferred = self.deferred.take()?;
        self.feedback.set_deferred(None);
        info!("Resuming deferred recording {}", deferred.recording.name);
        Some(self.route(deferred.recording, deferred.local_copy).await)
    }

    /// Give up on the deferred recording and make sure it exists locally.
    pub async fn abandon_deferred(&mut self) -> Option<Delivery> {
        let deferred = self.deferred.take()?;
        self.feedback.set_deferred(None);
        self.refresh_badge();
        Some(self.fall_back(&deferred.recording, deferred.local_copy).await)
    }

    fn refresh_badge(&self) {
        let badge = if self.credentials.check_validity() {
            AuthBadge::SignedIn
        } else {
            AuthBadge::SignedOut
        };
        self.feedback.set_auth(badge);
    }

    /// Interactive re-login.  Delivers the deferred recording on success.
    pub async fn login(&mut self) -> Result<Option<Delivery>, AuthError> {
        match self
            .credentials
            .authenticate(PromptMode::Interactive, AuthContext::Upload)
            .await
        {
            Ok(_) => {
                self.feedback.set_auth(AuthBadge::SignedIn);
                self.feedback.notify(NoticeLevel::Success, "Signed in to cloud storage");
                Ok(self.resume_deferred().await)
            }
            Err(e) => {
                self.feedback.notify(NoticeLevel::Error, format!("Sign-in failed: {e}"));
                Err(e)
            }
        }
    }

    /// Authenticate, then let the picker resolve a folder.  A pick persists
    /// the destination and delivers any deferred recording; a cancellation
    /// abandons it to local delivery.
    pub async fn select_destination(&mut self, query: &str) -> Result<Option<Destination>, PickError> {
        let token = match self
            .credentials
            .authenticate(PromptMode::Interactive, AuthContext::FolderSelection)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                self.feedback.notify(NoticeLevel::Error, format!("Sign-in failed: {e}"));
                return Err(e.into());
            }
        };
        if self.deferred.is_none() {
            self.feedback.set_auth(AuthBadge::SignedIn);
        }

        match self.picker.pick(&token, query).await {
            Ok(PickOutcome::Picked(destination)) => {
                if let Err(e) = save_json(self.store.as_ref(), FOLDER_KEY, &destination) {
                    warn!("Cannot persist destination folder: {e}");
                }
                self.feedback.set_destination(Some(destination.clone()));
                self.feedback.notify(
                    NoticeLevel::Success,
                    format!("Destination folder set to {}", destination.name),
                );
                self.destination = Some(destination.clone());
                if self.deferred.is_some() {
                    self.feedback.set_auth(AuthBadge::SignedIn);
                    self.resume_deferred().await;
                }
                Ok(Some(destination))
            }
            Ok(PickOutcome::Cancelled) => {
                match self.deferred.as_ref().map(|d| d.recording.file_name()) {
                    Some(file_name) => {
                        self.feedback.notify(
                            NoticeLevel::Warning,
                            format!("No folder selected – {file_name} stays local"),
                        );
                        self.abandon_deferred().await;
                    }
                    None => debug!("Folder selection cancelled"),
                }
                Ok(None)
            }
            Err(PickError::Unauthorized) => {
                self.credentials.invalidate();
                self.feedback.set_auth(AuthBadge::NeedsRelogin);
                self.feedback
                    .notify(NoticeLevel::Error, "Folder listing refused: sign-in expired");
                Err(PickError::Unauthorized)
            }
            Err(e) => {
                self.feedback.notify(NoticeLevel::Error, format!("{e}"));
                Err(e)
            }
        }
    }

    /// Persisted user preference for deferring on expired credentials.
    pub fn set_auto_upload(&mut self, enabled: bool) {
        self.auto_upload = enabled;
        if let Err(e) = save_json(self.store.as_ref(), AUTO_UPLOAD_KEY, &enabled) {
            warn!("Cannot persist auto-upload preference: {e}");
        }
        self.feedback.set_auto_upload(enabled);
        info!("Auto-upload {}", if enabled { "enabled" } else { "disabled" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StoredCredential;
    use crate::fakes::{FakeDownloads, FakePicker, FakeTokens, FakeUploader};
    use chrono::{TimeZone, Utc};
    use memo_common::store::{MemoryStore, TOKEN_KEY};

    struct Rig {
        pipeline: UploadPipeline,
        store: Arc<dyn KeyValueStore>,
        tokens: Arc<FakeTokens>,
        uploader: Arc<FakeUploader>,
        picker: Arc<FakePicker>,
        downloads: Arc<FakeDownloads>,
        feedback: Feedback,
    }

    struct RigOptions {
        destination: bool,
        token_valid_for_ms: Option<i64>,
        tokens: FakeTokens,
        uploader: FakeUploader,
        picker: FakePicker,
    }

    impl Default for RigOptions {
        fn default() -> Self {
            Self {
                destination: true,
                token_valid_for_ms: Some(60_000),
                tokens: FakeTokens::interactive_only("fresh"),
                uploader: FakeUploader::accepting(),
                picker: FakePicker::picking("folder-2", "Memos"),
            }
        }
    }

    fn rig(opts: RigOptions) -> Rig {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        if opts.destination {
            let folder = Destination {
                id: "folder-1".into(),
                name: "Voice".into(),
            };
            save_json(store.as_ref(), FOLDER_KEY, &folder).unwrap();
        }
        if let Some(ms) = opts.token_valid_for_ms {
            let cred = StoredCredential {
                access_token: "live".into(),
                expires_at: Utc::now().timestamp_millis() + ms,
            };
            save_json(store.as_ref(), TOKEN_KEY, &cred).unwrap();
        }
        let tokens = Arc::new(opts.tokens);
        let uploader = Arc::new(opts.uploader);
        let picker = Arc::new(opts.picker);
        let downloads = Arc::new(FakeDownloads::new());
        let feedback = Feedback::new();
        let credentials = CredentialManager::new(Some(tokens.clone()), Arc::clone(&store));
        let pipeline = UploadPipeline::new(
            credentials,
            uploader.clone(),
            picker.clone(),
            downloads.clone(),
            Arc::clone(&store),
            feedback.clone(),
            true,
        );
        Rig {
            pipeline,
            store,
            tokens,
            uploader,
            picker,
            downloads,
            feedback,
        }
    }

    fn recording(name: &str) -> Recording {
        Recording {
            id: "1".into(),
            name: name.into(),
            captured_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            duration_secs: 3,
            mime_type: "audio/mp4".into(),
            payload: Arc::from(b"audio".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_no_destination_downloads_without_network() {
        let mut r = rig(RigOptions {
            destination: false,
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;
        assert!(matches!(delivery, Delivery::Downloaded(_)));
        assert_eq!(r.downloads.file_names(), vec!["take.m4a"]);
        assert!(r.uploader.requests().is_empty());
        assert!(r.tokens.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_valid_credential_uploads_only() {
        let mut r = rig(RigOptions::default());
        let delivery = r.pipeline.deliver(recording("take")).await;

        assert_eq!(
            delivery,
            Delivery::Uploaded(UploadReceipt {
                file_id: "file-1".into()
            })
        );
        let requests = r.uploader.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "live");
        assert_eq!(requests[0].1.file_name, "take.m4a");
        assert_eq!(requests[0].1.parent, "folder-1");
        assert_eq!(requests[0].1.mime_type, "audio/mp4");
        assert!(r.downloads.file_names().is_empty());
        assert_eq!(r.feedback.messages().last().unwrap().0, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_rejected_upload_falls_back_without_invalidating() {
        let mut r = rig(RigOptions {
            uploader: FakeUploader::rejecting(500),
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;
        assert!(matches!(delivery, Delivery::Downloaded(_)));
        assert_eq!(r.downloads.file_names(), vec!["take.m4a"]);
        assert!(r.pipeline.credentials().check_validity());
    }

    #[tokio::test]
    async fn test_network_fault_falls_back_without_invalidating() {
        let mut r = rig(RigOptions {
            uploader: FakeUploader::network_error(),
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;

        assert_eq!(delivery, Delivery::Downloaded(PathBuf::from("/downloads/take.m4a")));
        assert_eq!(r.uploader.requests().len(), 1);
        assert!(r.pipeline.credentials().check_validity());
        let persisted: StoredCredential = load_json(r.store.as_ref(), TOKEN_KEY).unwrap().unwrap();
        assert_eq!(persisted.access_token, "live");
        assert_eq!(r.feedback.snapshot().auth, AuthBadge::SignedIn);
        assert!(r.pipeline.deferred().is_none());
    }

    #[tokio::test]
    async fn test_expired_credential_renews_silently() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: Some(-1),
            tokens: FakeTokens::granting("renewed"),
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;

        assert!(matches!(delivery, Delivery::Uploaded(_)));
        assert_eq!(r.tokens.prompts(), vec![PromptMode::Silent]);
        assert_eq!(r.uploader.requests()[0].0, "renewed");
        assert!(r.pipeline.deferred().is_none());
        assert!(r.downloads.file_names().is_empty());
        assert_eq!(r.feedback.snapshot().auth, AuthBadge::SignedIn);
    }

    #[tokio::test]
    async fn test_unauthorized_upload_invalidates_credential() {
        let mut r = rig(RigOptions {
            uploader: FakeUploader::unauthorized(),
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;
        assert!(matches!(delivery, Delivery::Downloaded(_)));
        assert!(!r.pipeline.credentials().check_validity());
        assert!(r.store.get(TOKEN_KEY).unwrap().is_none());
        assert_eq!(r.feedback.snapshot().auth, AuthBadge::NeedsRelogin);
        assert!(r.pipeline.deferred().is_none());
    }

    #[tokio::test]
    async fn test_expired_credential_defers_then_uploads_after_login() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: Some(-1),
            ..Default::default()
        });
        let delivery = r.pipeline.deliver(recording("take")).await;

        assert!(matches!(delivery, Delivery::Deferred { local_copy: Some(_) }));
        assert_eq!(r.pipeline.deferred().unwrap().recording.name, "take");
        assert_eq!(r.downloads.file_names(), vec!["take.m4a"]);
        assert!(r.uploader.requests().is_empty());
        let status = r.feedback.snapshot();
        assert_eq!(status.auth, AuthBadge::NeedsRelogin);
        assert_eq!(status.deferred.as_deref(), Some("take"));

        let resumed = r.pipeline.login().await.unwrap();
        assert!(matches!(resumed, Some(Delivery::Uploaded(_))));
        assert!(r.pipeline.deferred().is_none());
        assert_eq!(r.uploader.requests().len(), 1);
        assert_eq!(r.uploader.requests()[0].0, "fresh");
        assert_eq!(r.downloads.file_names().len(), 1);
        let status = r.feedback.snapshot();
        assert_eq!(status.auth, AuthBadge::SignedIn);
        assert!(status.deferred.is_none());

        // Cleared exactly once: a second login has nothing to resume.
        assert_eq!(r.pipeline.login().await.unwrap(), None);
        assert_eq!(r.uploader.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_credential_without_auto_upload_downloads() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            ..Default::default()
        });
        r.pipeline.set_auto_upload(false);
        let delivery = r.pipeline.deliver(recording("take")).await;
        assert!(matches!(delivery, Delivery::Downloaded(_)));
        assert!(r.pipeline.deferred().is_none());
        assert_eq!(load_json::<bool>(r.store.as_ref(), AUTO_UPLOAD_KEY).unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_second_deferral_replaces_first() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            ..Default::default()
        });
        r.pipeline.deliver(recording("first")).await;
        r.pipeline.deliver(recording("second")).await;

        assert_eq!(r.pipeline.deferred().unwrap().recording.name, "second");
        assert_eq!(r.downloads.file_names(), vec!["first.m4a", "second.m4a"]);
    }

    #[tokio::test]
    async fn test_failed_resume_reuses_local_copy() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            uploader: FakeUploader::rejecting(503),
            ..Default::default()
        });
        r.pipeline.deliver(recording("take")).await;
        let resumed = r.pipeline.login().await.unwrap();
        assert!(matches!(resumed, Some(Delivery::Downloaded(_))));
        assert_eq!(r.downloads.file_names().len(), 1);
    }

    #[tokio::test]
    async fn test_pick_persists_and_delivers_deferred() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            ..Default::default()
        });
        r.pipeline.deliver(recording("take")).await;

        let picked = r.pipeline.select_destination("Memos").await.unwrap();
        assert_eq!(picked.unwrap().id, "folder-2");
        let saved: Destination = load_json(r.store.as_ref(), FOLDER_KEY).unwrap().unwrap();
        assert_eq!(saved.name, "Memos");
        assert_eq!(r.picker.queries(), vec!["Memos"]);
        assert!(r.pipeline.deferred().is_none());
        assert_eq!(r.uploader.requests()[0].1.parent, "folder-2");
    }

    #[tokio::test]
    async fn test_cancelled_pick_abandons_deferred() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            picker: FakePicker::cancelling(),
            ..Default::default()
        });
        r.pipeline.deliver(recording("take")).await;

        assert_eq!(r.pipeline.select_destination("nothing").await.unwrap(), None);
        assert!(r.pipeline.deferred().is_none());
        // The safety-net copy already exists.
        assert_eq!(r.downloads.file_names().len(), 1);
        assert!(r.uploader.requests().is_empty());
        assert_eq!(r.feedback.snapshot().auth, AuthBadge::SignedIn);
    }

    #[tokio::test]
    async fn test_failed_auth_keeps_deferred() {
        let mut r = rig(RigOptions {
            token_valid_for_ms: None,
            ..Default::default()
        });
        r.tokens.fail_all();
        r.pipeline.deliver(recording("take")).await;

        let err = r.pipeline.select_destination("Memos").await.unwrap_err();
        assert!(matches!(err, PickError::Auth(_)));
        assert_eq!(
            r.tokens.prompts(),
            vec![PromptMode::Silent, PromptMode::Interactive, PromptMode::Consent]
        );
        assert!(r.pipeline.deferred().is_some());
    }
}
