//! Wake-lock guardian – keeps the screen from sleeping while recording.
//!
//! The lock is an enhancement: failing to get one produces a warning and
//! recording carries on.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memo_common::protocol::NoticeLevel;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::device::drain_stderr;
use crate::feedback::Feedback;

#[derive(Debug, Clone, Error)]
pub enum WakeLockError {
    #[error("wake lock unsupported: {0}")]
    Unsupported(String),

    #[error("wake lock refused: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeLockKind {
    Screen,
}

pub trait WakeLock: Send {
    /// True once the platform has dropped the lock on its own.
    fn is_released(&mut self) -> bool;
    fn release(&mut self);
}

#[async_trait]
pub trait WakeLockProvider: Send + Sync {
    async fn request(&self, kind: WakeLockKind) -> Result<Box<dyn WakeLock>, WakeLockError>;
}

pub struct WakeLockGuardian {
    provider: Arc<dyn WakeLockProvider>,
    lock: Option<Box<dyn WakeLock>>,
    feedback: Feedback,
}

impl WakeLockGuardian {
    pub fn new(provider: Arc<dyn WakeLockProvider>, feedback: Feedback) -> Self {
        Self {
            provider,
            lock: None,
            feedback,
        }
    }

    /// Whether a live lock is currently held.
    pub fn is_held(&mut self) -> bool {
        self.lock.as_mut().map(|l| !l.is_released()).unwrap_or(false)
    }

    /// Acquire the screen lock unless a live one is already held.
    pub async fn acquire(&mut self) {
        if self.is_held() {
            return;
        }
        match self.provider.request(WakeLockKind::Screen).await {
            Ok(lock) => {
                info!("Wake lock acquired");
                self.lock = Some(lock);
            }
            Err(WakeLockError::Unsupported(reason)) => {
                debug!("Wake lock unsupported: {reason}");
                self.feedback.notify(
                    NoticeLevel::Warning,
                    "Screen sleep prevention is not supported here – keep the screen on while recording.",
                );
            }
            Err(WakeLockError::Refused(reason)) => {
                debug!("Wake lock refused: {reason}");
                self.feedback.notify(
                    NoticeLevel::Warning,
                    "Screen sleep prevention is unavailable – keep the screen on while recording.",
                );
            }
        }
    }

    /// Release the lock if held.  Idempotent.
    pub fn release(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
            info!("Wake lock released");
        }
    }

    /// Re-acquire when the page becomes visible again mid-recording; some
    /// platforms drop the lock while backgrounded.
    pub async fn on_visibility_change(&mut self, visible: bool, recording: bool) {
        if visible && recording && !self.is_held() {
            debug!("Visible again while recording – re-acquiring wake lock");
            self.acquire().await;
        }
    }
}

// ── systemd-inhibit ──────────────────────────────────────────────────────

/// Holds an idle/sleep inhibitor for as long as a `systemd-inhibit` child
/// stays alive.
pub struct SystemdInhibitor;

const INHIBIT_SETTLE: Duration = Duration::from_millis(200);

#[async_trait]
impl WakeLockProvider for SystemdInhibitor {
    async fn request(&self, kind: WakeLockKind) -> Result<Box<dyn WakeLock>, WakeLockError> {
        let what = match kind {
            WakeLockKind::Screen => "idle:sleep",
        };
        let what_arg = format!("--what={what}");
        let mut child = Command::new("systemd-inhibit")
            .args([
                what_arg.as_str(),
                "--who=memo-recorder",
                "--why=Recording in progress",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => WakeLockError::Unsupported("systemd-inhibit not found".into()),
                _ => WakeLockError::Refused(e.to_string()),
            })?;

        tokio::time::sleep(INHIBIT_SETTLE).await;
        if let Ok(Some(status)) = child.try_wait() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(WakeLockError::Refused(format!(
                "systemd-inhibit exited with {status}: {}",
                stderr.trim()
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            drain_stderr("systemd-inhibit", stderr);
        }
        Ok(Box::new(InhibitLock { child }))
    }
}

struct InhibitLock {
    child: Child,
}

impl WakeLock for InhibitLock {
    fn is_released(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn release(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("systemd-inhibit already gone: {e}");
        }
    }
}

impl Drop for InhibitLock {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!("Wake lock dropped without release – killing inhibitor");
            self.release();
        }
    }
}
