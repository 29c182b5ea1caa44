//! Configuration parsing – reads a KEY=VALUE file (`memo.conf`).
//!
//! The same file drives the capture devices, the local stores and the
//! Google Drive integration.  Unknown keys are ignored so one file can be
//! shared across deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tracing::info;

/// OAuth client credentials for the cloud-storage integration.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Seeds silent authentication; without it the first login is interactive.
    pub refresh_token: Option<String>,
}

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── control surface ──────────────────────────────────────────────
    /// Address the local control API listens on.
    pub listen_addr: String,

    // ── local state ──────────────────────────────────────────────────
    /// Directory holding the persisted key-value documents.
    pub state_dir: PathBuf,
    /// Where local deliveries ("downloads") are written.
    pub download_dir: PathBuf,

    // ── recording ────────────────────────────────────────────────────
    pub rec_card: Option<String>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Initial auto-upload preference, used until the user toggles it.
    pub auto_upload: bool,
    pub name_prefix: String,
    /// UTC offset used for auto-generated names; local time when unset.
    pub name_utc_offset: Option<FixedOffset>,

    // ── cloud storage ────────────────────────────────────────────────
    pub google: Option<GoogleConfig>,
    pub upload_timeout_secs: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/memo/memo.conf"
    }

    /// Whether the cloud-storage capabilities can be constructed at all.
    pub fn cloud_enabled(&self) -> bool {
        self.google.is_some()
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Result<Config> {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    };

    let state_dir = PathBuf::from(get("STATE_DIR").unwrap_or_else(|| "/var/lib/memo".into()));
    let download_dir = get("DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("Downloads"));

    let name_utc_offset = match get("NAME_UTC_OFFSET_MINUTES") {
        Some(raw) => {
            let minutes: i32 = raw
                .parse()
                .with_context(|| format!("NAME_UTC_OFFSET_MINUTES is not an integer: {raw}"))?;
            Some(
                FixedOffset::east_opt(minutes * 60)
                    .with_context(|| format!("NAME_UTC_OFFSET_MINUTES out of range: {minutes}"))?,
            )
        }
        None => None,
    };

    let google = get("GOOGLE_CLIENT_ID").map(|client_id| GoogleConfig {
        client_id,
        client_secret: get("GOOGLE_CLIENT_SECRET"),
        refresh_token: get("GOOGLE_REFRESH_TOKEN"),
    });

    Ok(Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8091".into()),
        state_dir,
        download_dir,
        rec_card: get("REC_CARD"),
        channels: get("CHANNELS").and_then(|v| v.parse().ok()).unwrap_or(1),
        sample_rate: get("SAMPLE_RATE").and_then(|v| v.parse().ok()).unwrap_or(48_000),
        auto_upload: get_bool("AUTO_UPLOAD", true),
        name_prefix: get("NAME_PREFIX").unwrap_or_else(|| "recording".into()),
        name_utc_offset,
        google,
        upload_timeout_secs: get("UPLOAD_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(120),
    })
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
