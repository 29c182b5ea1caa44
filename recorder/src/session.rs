//! Recorder session – the one object that owns every component and
//! sequences a take from microphone to delivery.
//!
//! start: microphone + encoder → timer → wake lock
//! stop:  encoder flush → timer / wake lock torn down → catalog → delivery

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use memo_common::catalog::Catalog;
use memo_common::protocol::{Destination, NoticeLevel, RecordingListItem, ToggleOutcome, ToggleResponse};
use memo_common::recording::{default_name, CatalogEntry, IdGenerator, Payload, Recording};
use memo_common::store::{KeyValueStore, StoreError};

use crate::capture::{CaptureController, CaptureError, Encoder, Microphone};
use crate::credentials::{AuthError, CredentialManager, TokenProvider};
use crate::delivery::LocalDelivery;
use crate::feedback::Feedback;
use crate::timer::SessionTimer;
use crate::upload::{Delivery, FolderPicker, PickError, UploadPipeline, Uploader};
use crate::wake_lock::{WakeLockGuardian, WakeLockProvider};

/// Platform capabilities the session runs on.
pub struct Capabilities {
    pub microphone: Arc<dyn Microphone>,
    pub encoder: Arc<dyn Encoder>,
    pub wake_locks: Arc<dyn WakeLockProvider>,
    /// `None` when cloud storage is not configured.
    pub tokens: Option<Arc<dyn TokenProvider>>,
    pub uploader: Arc<dyn Uploader>,
    pub picker: Arc<dyn FolderPicker>,
    pub local: Arc<dyn LocalDelivery>,
    pub store: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub name_prefix: String,
    pub name_utc_offset: Option<FixedOffset>,
    pub auto_upload: bool,
}

/// Result of stopping a take.
#[derive(Debug, Clone)]
pub struct Finished {
    pub entry: CatalogEntry,
    pub delivery: Delivery,
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("recording not found")]
    NotFound,

    #[error("recording data not found")]
    DataGone,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

/// A cataloged recording on its way to the local download directory.
pub struct LocalSave {
    entry: CatalogEntry,
    payload: Payload,
    local: Arc<dyn LocalDelivery>,
    feedback: Feedback,
}

impl LocalSave {
    pub async fn write(self) -> Result<PathBuf, SaveError> {
        let path = match self.local.deliver(&self.entry.file_name(), &self.payload).await {
            Ok(path) => path,
            Err(e) => {
                self.feedback
                    .notify(NoticeLevel::Error, format!("Cannot save {}: {e:#}", self.entry.file_name()));
                return Err(e.into());
            }
        };
        self.feedback
            .notify(NoticeLevel::Success, format!("Saved {}", path.display()));
        Ok(path)
    }
}

pub struct Recorder {
    capture: CaptureController,
    timer: SessionTimer,
    wake_lock: WakeLockGuardian,
    pipeline: UploadPipeline,
    catalog: Catalog,
    local: Arc<dyn LocalDelivery>,
    ids: IdGenerator,
    settings: SessionSettings,
    feedback: Feedback,
}

impl Recorder {
    pub fn new(caps: Capabilities, settings: SessionSettings, feedback: Feedback) -> Self {
        let credentials = CredentialManager::new(caps.tokens, Arc::clone(&caps.store));
        let pipeline = UploadPipeline::new(
            credentials,
            caps.uploader,
            caps.picker,
            Arc::clone(&caps.local),
            Arc::clone(&caps.store),
            feedback.clone(),
            settings.auto_upload,
        );
        feedback.set_status("Idle", false);

        Self {
            capture: CaptureController::new(caps.microphone, caps.encoder),
            timer: SessionTimer::new(feedback.clone()),
            wake_lock: WakeLockGuardian::new(caps.wake_locks, feedback.clone()),
            pipeline,
            catalog: Catalog::new(caps.store),
            local: caps.local,
            ids: IdGenerator::default(),
            settings,
            feedback,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    /// Start when idle, stop when recording.
    pub async fn toggle(&mut self, name: Option<String>) -> ToggleResponse {
        if self.is_recording() {
            let finished = self.stop(name).await;
            return ToggleResponse {
                outcome: ToggleOutcome::Stopped,
                recording_id: finished.map(|f| {
                    debug!("Take {} delivered: {:?}", f.entry.id, f.delivery);
                    f.entry.id
                }),
            };
        }
        let outcome = match self.start().await {
            Ok(_) => ToggleOutcome::Started,
            Err(_) => ToggleOutcome::NotStarted,
        };
        ToggleResponse {
            outcome,
            recording_id: None,
        }
    }

    /// Begin a take.  `Ok(false)` when one is already running.
    pub async fn start(&mut self) -> Result<bool, CaptureError> {
        match self.capture.start().await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                let message = match &e {
                    CaptureError::PermissionDenied(_) => {
                        "Microphone access was denied – allow it and try again".to_string()
                    }
                    CaptureError::DeviceUnavailable(_) => "No microphone available".to_string(),
                    CaptureError::EncoderFailed(detail) => format!("Cannot start the encoder: {detail}"),
                };
                warn!("Start failed: {e}");
                self.feedback.notify(NoticeLevel::Error, message);
                return Err(e);
            }
        }

        self.timer.start();
        self.wake_lock.acquire().await;
        self.feedback.set_status("Recording…", true);
        self.feedback.notify(NoticeLevel::Info, "Recording started");
        Ok(true)
    }

    /// Finish the take, catalog it and route it.  `None` when idle.
    ///
    /// `name` is the user-supplied display name; blank or absent names are
    /// generated from the capture time.
    pub async fn stop(&mut self, name: Option<String>) -> Option<Finished> {
        let pending = self.capture.stop()?;
        self.timer.stop();
        self.wake_lock.release();
        self.feedback.set_status("Finishing…", false);

        let encoded = pending.wait().await;
        let duration_secs = self.timer.take_elapsed();
        let captured_at = Utc::now();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_name(&self.settings.name_prefix, captured_at, self.settings.name_utc_offset));

        if encoded.bytes.is_empty() {
            warn!("Encoder produced no audio for {name}");
        }
        let recording = Recording {
            id: self.ids.next(captured_at),
            name,
            captured_at,
            duration_secs,
            mime_type: encoded.mime_type,
            payload: Payload::from(encoded.bytes),
        };
        info!("Finished {recording}");

        if let Err(e) = self.catalog.append(&recording) {
            self.feedback
                .notify(NoticeLevel::Error, format!("Cannot save recording list: {e}"));
        }
        let entry = recording.entry();
        let delivery = self.pipeline.deliver(recording).await;
        self.feedback.set_status("Idle", false);
        Some(Finished { entry, delivery })
    }

    pub async fn visibility_changed(&mut self, visible: bool) {
        let recording = self.is_recording();
        self.wake_lock.on_visibility_change(visible, recording).await;
    }

    pub async fn select_destination(&mut self, query: &str) -> Result<Option<Destination>, PickError> {
        self.pipeline.select_destination(query).await
    }

    pub async fn login(&mut self) -> Result<Option<Delivery>, AuthError> {
        self.pipeline.login().await
    }

    pub fn set_auto_upload(&mut self, enabled: bool) {
        self.pipeline.set_auto_upload(enabled);
    }

    pub fn recordings(&self) -> Result<Vec<RecordingListItem>, StoreError> {
        Ok(self
            .catalog
            .load_all()?
            .into_iter()
            .map(|entry| {
                let saveable = self.catalog.payload(&entry.id).is_some();
                RecordingListItem::new(entry, saveable)
            })
            .collect())
    }

    /// Entry plus the payload captured this session.
    pub fn payload(&self, id: &str) -> Result<(CatalogEntry, Payload), SaveError> {
        let entry = self.catalog.find(id)?.ok_or(SaveError::NotFound)?;
        let payload = self.catalog.payload(id).ok_or(SaveError::DataGone)?;
        Ok((entry, payload))
    }

    /// Resolve a manual local save.  The write itself runs on the returned
    /// [`LocalSave`], which needs no access to the recorder.
    pub fn save_local(&self, id: &str) -> Result<LocalSave, SaveError> {
        match self.payload(id) {
            Ok((entry, payload)) => Ok(LocalSave {
                entry,
                payload,
                local: Arc::clone(&self.local),
                feedback: self.feedback.clone(),
            }),
            Err(e) => {
                self.feedback.notify(NoticeLevel::Error, format!("Cannot save: {e}"));
                Err(e)
            }
        }
    }

    /// Stop and deliver an in-progress take before exit.
    pub async fn shutdown(&mut self) {
        if self.is_recording() {
            info!("Shutting down mid-recording – finishing the take");
            self.stop(None).await;
        }
    }
}
