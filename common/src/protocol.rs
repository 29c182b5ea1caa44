//! JSON types exchanged over the local control API.

use serde::{Deserialize, Serialize};

use crate::recording::{format_duration, format_size, CatalogEntry};

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// Cloud sign-in badge shown next to the destination control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthBadge {
    #[default]
    SignedOut,
    SignedIn,
    /// A deferred recording is waiting for the user to log in again.
    NeedsRelogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Selected cloud folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
}

/// Everything the status indicator needs in one read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub recording: bool,
    /// `HH:MM:SS`.
    pub elapsed: String,
    pub status: String,
    pub auth: AuthBadge,
    pub destination: Option<Destination>,
    pub auto_upload: bool,
    pub deferred: Option<String>,
    pub notices: Vec<Notice>,
}

/// A catalog entry decorated for the recordings list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingListItem {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub duration_display: String,
    pub size_display: String,
    /// Whether the payload is still held and a manual save can succeed.
    pub saveable: bool,
}

impl RecordingListItem {
    pub fn new(entry: CatalogEntry, saveable: bool) -> Self {
        Self {
            duration_display: format_duration(entry.duration),
            size_display: format_size(entry.size),
            entry,
            saveable,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToggleRequest {
    /// Display name for the take being stopped; auto-generated when absent.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ToggleOutcome {
    Started,
    Stopped,
    /// The microphone could not be opened; still idle.
    NotStarted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub outcome: ToggleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRequest {
    /// Folder name (or id) to look for.
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoUploadRequest {
    pub enabled: bool,
}

/// Where a manual save landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResponse {
    pub path: String,
}
