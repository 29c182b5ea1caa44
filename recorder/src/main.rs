//! memo recorder – captures voice memos and delivers them to a Google
//! Drive folder, falling back to local files.
//!
//! This binary:
//! 1. Reads configuration from `memo.conf`
//! 2. Probes ffmpeg and wires up the native capabilities
//! 3. Runs the local control API until Ctrl-C, then finishes any take
//!    still in progress.

mod capture;
mod credentials;
mod delivery;
mod device;
mod drive;
mod feedback;
mod server;
mod session;
mod timer;
mod upload;
mod wake_lock;

#[cfg(test)]
mod fakes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use memo_common::config::Config;
use memo_common::store::{FileStore, KeyValueStore};

use crate::capture::PcmFormat;
use crate::credentials::TokenProvider;
use crate::delivery::DownloadDir;
use crate::device::{ArecordMicrophone, FfmpegEncoder};
use crate::drive::{DriveFolderPicker, DriveUploader, GoogleAuth};
use crate::feedback::Feedback;
use crate::session::{Capabilities, Recorder, SessionSettings};
use crate::wake_lock::SystemdInhibitor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = memo_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "memo recorder starting (listen={}, state={})",
        config.listen_addr,
        config.state_dir.display()
    );

    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::open(&config.state_dir).context("Cannot open state directory")?);
    let encoder = FfmpegEncoder::probe()
        .await
        .context("ffmpeg is required for encoding")?;

    // ── capabilities ─────────────────────────────────────────────────
    let feedback = Feedback::new();
    let client = drive::http_client(config.upload_timeout_secs)?;
    let tokens = config.google.as_ref().map(|google| {
        Arc::new(GoogleAuth::new(client.clone(), google, feedback.clone())) as Arc<dyn TokenProvider>
    });
    if !config.cloud_enabled() {
        info!("GOOGLE_CLIENT_ID not set – recordings will be saved locally only");
    }

    let caps = Capabilities {
        microphone: Arc::new(ArecordMicrophone::new(
            config.rec_card.clone(),
            PcmFormat {
                sample_rate: config.sample_rate,
                channels: config.channels,
            },
        )),
        encoder: Arc::new(encoder),
        wake_locks: Arc::new(SystemdInhibitor),
        tokens,
        uploader: Arc::new(DriveUploader::new(client.clone())),
        picker: Arc::new(DriveFolderPicker::new(client)),
        local: Arc::new(DownloadDir::new(config.download_dir.clone())),
        store,
    };
    let settings = SessionSettings {
        name_prefix: config.name_prefix.clone(),
        name_utc_offset: config.name_utc_offset,
        auto_upload: config.auto_upload,
    };
    let recorder = Arc::new(Mutex::new(Recorder::new(caps, settings, feedback.clone())));

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── control API ──────────────────────────────────────────────────
    if let Err(e) = server::run(Arc::clone(&recorder), feedback, &config.listen_addr, shutdown).await {
        error!("Control API error: {e:#}");
    }

    recorder.lock().await.shutdown().await;
    info!("memo recorder stopped");

    Ok(())
}
