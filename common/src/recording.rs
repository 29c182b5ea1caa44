//! Recording metadata, naming and media-type helpers.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};

/// Encoded audio bytes.  Shared so the catalog can keep a handle for manual
/// saves while the delivery path consumes the recording.
pub type Payload = Arc<[u8]>;

/// Persisted subset of a [`Recording`]: everything except the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    /// ISO-8601 capture timestamp.
    pub date: String,
    /// Whole seconds.
    pub duration: u64,
    /// Payload size in bytes.
    pub size: u64,
    pub mime_type: String,
}

impl CatalogEntry {
    /// File name used for uploads and local deliveries.
    pub fn file_name(&self) -> String {
        file_name(&self.name, &self.mime_type)
    }
}

/// A finished take.  Only lives for the session that produced it.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub mime_type: String,
    pub payload: Payload,
}

impl Recording {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn file_name(&self) -> String {
        file_name(&self.name, &self.mime_type)
    }

    pub fn entry(&self) -> CatalogEntry {
        CatalogEntry {
            id: self.id.clone(),
            name: self.name.clone(),
            date: self.captured_at.to_rfc3339(),
            duration: self.duration_secs,
            size: self.size(),
            mime_type: self.mime_type.clone(),
        }
    }
}

impl std::fmt::Display for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Recording({}, {}, {}s, {} bytes, {})",
            self.id,
            self.name,
            self.duration_secs,
            self.size(),
            self.mime_type
        )
    }
}

/// Hands out time-based ids, bumping by one when two takes land in the
/// same millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: i64,
}

impl IdGenerator {
    pub fn next(&mut self, now: DateTime<Utc>) -> String {
        let millis = now.timestamp_millis().max(self.last + 1);
        self.last = millis;
        millis.to_string()
    }
}

/// Auto-generated display name: `<prefix>_YYYYMMDD_HHMM`.
pub fn default_name(prefix: &str, captured_at: DateTime<Utc>, offset: Option<FixedOffset>) -> String {
    let stamp = match offset {
        Some(offset) => captured_at.with_timezone(&offset).format("%Y%m%d_%H%M").to_string(),
        None => captured_at.with_timezone(&Local).format("%Y%m%d_%H%M").to_string(),
    };
    format!("{prefix}_{stamp}")
}

/// File extension for an encoded media type.
pub fn extension_for(mime_type: &str) -> &'static str {
    let mime = mime_type.to_ascii_lowercase();
    if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        "m4a"
    } else if mime.contains("mpeg") || mime.contains("mp3") {
        "mp3"
    } else if mime.contains("webm") {
        "webm"
    } else if mime.contains("ogg") {
        "ogg"
    } else {
        "m4a"
    }
}

pub fn file_name(name: &str, mime_type: &str) -> String {
    format!("{name}.{}", extension_for(mime_type))
}

/// `HH:MM:SS` for the elapsed-time display and the recordings list.
pub fn format_duration(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// Human-readable size (`B`, `KB`, `MB`).
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
