//! In-process stand-ins for every platform capability, used by the unit
//! tests.  Each fake records what it was asked to do.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use memo_common::protocol::Destination;

use crate::capture::{
    AudioConstraints, AudioStream, CaptureError, Encoder, EncoderEvent, EncoderHandle, EncoderSession,
    Microphone, PcmFormat, PcmReader,
};
use crate::credentials::{AuthError, PromptMode, TokenGrant, TokenProvider};
use crate::delivery::LocalDelivery;
use crate::upload::{FolderPicker, PickError, PickOutcome, UploadError, UploadReceipt, UploadRequest, Uploader};
use crate::wake_lock::{WakeLock, WakeLockError, WakeLockKind, WakeLockProvider};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── microphone ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMicrophone {
    deny: bool,
    constraints: Mutex<Vec<AudioConstraints>>,
    stops: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn acquisitions(&self) -> usize {
        lock(&self.constraints).len()
    }

    pub fn constraints(&self) -> Vec<AudioConstraints> {
        lock(&self.constraints).clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct FakeStream {
    constraints: AudioConstraints,
    reader: Option<PcmReader>,
    stopped: bool,
    stops: Arc<AtomicUsize>,
}

impl AudioStream for FakeStream {
    fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: 48_000,
            channels: 1,
        }
    }

    fn constraints(&self) -> AudioConstraints {
        self.constraints
    }

    fn take_reader(&mut self) -> Option<PcmReader> {
        self.reader.take()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<Box<dyn AudioStream>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied("denied by test".into()));
        }
        lock(&self.constraints).push(constraints);
        Ok(Box::new(FakeStream {
            constraints,
            reader: Some(Box::new(tokio::io::empty())),
            stopped: false,
            stops: Arc::clone(&self.stops),
        }))
    }
}

// ── encoder ──────────────────────────────────────────────────────────────

/// Emits its chunks straight away and flushes on stop.
#[derive(Default)]
pub struct FakeEncoder {
    supported: Vec<String>,
    chunks: Vec<Vec<u8>>,
    no_flush: bool,
    fail: bool,
    started: Mutex<Vec<String>>,
}

impl FakeEncoder {
    pub fn supporting(types: &[&str]) -> Self {
        Self {
            supported: types.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Close the event channel on stop without a flush event.
    pub fn without_flush(mut self) -> Self {
        self.no_flush = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn started_with(&self) -> Vec<String> {
        lock(&self.started).clone()
    }
}

struct FakeEncoderHandle {
    tx: Option<mpsc::UnboundedSender<EncoderEvent>>,
    flush: bool,
}

impl EncoderHandle for FakeEncoderHandle {
    fn request_stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if self.flush {
                let _ = tx.send(EncoderEvent::Flushed { mime_type: None });
            }
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|t| t == mime_type)
    }

    async fn start(
        &self,
        stream: &mut dyn AudioStream,
        mime_type: &str,
        _timeslice: Duration,
    ) -> Result<EncoderSession, CaptureError> {
        if self.fail {
            return Err(CaptureError::EncoderFailed("failing by test".into()));
        }
        stream.take_reader();
        lock(&self.started).push(mime_type.to_string());

        let (tx, events) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(EncoderEvent::Chunk(chunk.clone()));
        }
        Ok(EncoderSession {
            handle: Box::new(FakeEncoderHandle {
                tx: Some(tx),
                flush: !self.no_flush,
            }),
            events,
        })
    }
}

// ── wake lock ────────────────────────────────────────────────────────────

pub struct FakeWakeLocks {
    supported: bool,
    issued: Mutex<Vec<Arc<AtomicBool>>>,
    releases: Arc<AtomicUsize>,
}

impl FakeWakeLocks {
    pub fn granting() -> Self {
        Self {
            supported: true,
            issued: Mutex::default(),
            releases: Arc::default(),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::granting()
        }
    }

    pub fn requests(&self) -> usize {
        lock(&self.issued).len()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Simulate the platform dropping every lock on its own.
    pub fn drop_all(&self) {
        for released in lock(&self.issued).iter() {
            released.store(true, Ordering::SeqCst);
        }
    }
}

struct FakeLock {
    released: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl WakeLock for FakeLock {
    fn is_released(&mut self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WakeLockProvider for FakeWakeLocks {
    async fn request(&self, _kind: WakeLockKind) -> Result<Box<dyn WakeLock>, WakeLockError> {
        if !self.supported {
            return Err(WakeLockError::Unsupported("unsupported by test".into()));
        }
        let released = Arc::new(AtomicBool::new(false));
        lock(&self.issued).push(Arc::clone(&released));
        Ok(Box::new(FakeLock {
            released,
            releases: Arc::clone(&self.releases),
        }))
    }
}

// ── auth ─────────────────────────────────────────────────────────────────

pub struct FakeTokens {
    token: String,
    failures_left: AtomicUsize,
    fail_all: AtomicBool,
    refuse_silent: bool,
    delay: Duration,
    prompts: Mutex<Vec<PromptMode>>,
}

impl FakeTokens {
    pub fn granting(token: &str) -> Self {
        Self::failing_then(token, 0)
    }

    /// Fail the first `failures` requests, then grant.
    pub fn failing_then(token: &str, failures: usize) -> Self {
        Self {
            token: token.to_string(),
            failures_left: AtomicUsize::new(failures),
            fail_all: AtomicBool::new(false),
            refuse_silent: false,
            delay: Duration::ZERO,
            prompts: Mutex::default(),
        }
    }

    /// Grant only when the user is prompted; silent requests fail as if no
    /// refresh token were known.
    pub fn interactive_only(token: &str) -> Self {
        Self {
            refuse_silent: true,
            ..Self::granting(token)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> Vec<PromptMode> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn request_token(&self, prompt: PromptMode) -> Result<TokenGrant, AuthError> {
        lock(&self.prompts).push(prompt);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.refuse_silent && prompt == PromptMode::Silent {
            return Err(AuthError::Failed("no refresh token".into()));
        }
        let scheduled_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.fail_all.load(Ordering::SeqCst) {
            return Err(AuthError::Failed("popup closed".into()));
        }
        Ok(TokenGrant {
            access_token: self.token.clone(),
            expires_in: Duration::from_secs(3600),
        })
    }
}

// ── cloud storage ────────────────────────────────────────────────────────

pub struct FakeUploader {
    result: Result<(), UploadError>,
    delay: Duration,
    requests: Mutex<Vec<(String, UploadRequest)>>,
}

impl FakeUploader {
    fn with_result(result: Result<(), UploadError>) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            requests: Mutex::default(),
        }
    }

    pub fn accepting() -> Self {
        Self::with_result(Ok(()))
    }

    pub fn rejecting(status: u16) -> Self {
        Self::with_result(Err(UploadError::Rejected { status }))
    }

    pub fn unauthorized() -> Self {
        Self::with_result(Err(UploadError::Unauthorized))
    }

    pub fn network_error() -> Self {
        Self::with_result(Err(UploadError::Network("connection reset".into())))
    }

    /// Take `delay` before answering; the request is recorded afterwards.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `(access_token, request)` pairs in call order.
    pub fn requests(&self) -> Vec<(String, UploadRequest)> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload(&self, access_token: &str, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut requests = lock(&self.requests);
        requests.push((access_token.to_string(), request));
        let n = requests.len();
        self.result.clone().map(|()| UploadReceipt {
            file_id: format!("file-{n}"),
        })
    }
}

pub struct FakePicker {
    outcome: PickOutcome,
    queries: Mutex<Vec<String>>,
}

impl FakePicker {
    pub fn picking(id: &str, name: &str) -> Self {
        Self {
            outcome: PickOutcome::Picked(Destination {
                id: id.into(),
                name: name.into(),
            }),
            queries: Mutex::default(),
        }
    }

    pub fn cancelling() -> Self {
        Self {
            outcome: PickOutcome::Cancelled,
            queries: Mutex::default(),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl FolderPicker for FakePicker {
    async fn pick(&self, _access_token: &str, query: &str) -> Result<PickOutcome, PickError> {
        lock(&self.queries).push(query.to_string());
        Ok(self.outcome.clone())
    }
}

// ── local delivery ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDownloads {
    saved: Mutex<Vec<(String, usize)>>,
}

impl FakeDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_names(&self) -> Vec<String> {
        lock(&self.saved).iter().map(|(name, _)| name.clone()).collect()
    }
}

#[async_trait]
impl LocalDelivery for FakeDownloads {
    async fn deliver(&self, file_name: &str, payload: &[u8]) -> anyhow::Result<PathBuf> {
        lock(&self.saved).push((file_name.to_string(), payload.len()));
        Ok(Path::new("/downloads").join(file_name))
    }
}
