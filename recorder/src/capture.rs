//! Capture controller – owns the microphone stream and the encoder that
//! turns it into a sequence of encoded chunks.
//!
//! Both platform pieces sit behind traits ([`Microphone`], [`Encoder`]);
//! the native implementations live in `device.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Containers in descending order of preference.
pub const MIME_PREFERENCE: [&str; 4] = [
    "audio/mp4",
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
];

/// Used when the encoder supports none of [`MIME_PREFERENCE`].
pub const FALLBACK_MIME: &str = "audio/webm";

/// Encoded chunks are emitted at this cadence.
pub const CHUNK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no usable microphone: {0}")]
    DeviceUnavailable(String),

    #[error("encoder failed to start: {0}")]
    EncoderFailed(String),
}

/// Processing requested from the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    /// Everything on, as wanted for voice memos.
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Raw signed 16-bit little-endian PCM layout of a microphone stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

pub type PcmReader = Box<dyn AsyncRead + Send + Unpin>;

/// A live microphone stream.
pub trait AudioStream: Send {
    fn format(&self) -> PcmFormat;
    fn constraints(&self) -> AudioConstraints;
    /// Hand the PCM reader to the encoder.  Returns `None` once taken.
    fn take_reader(&mut self) -> Option<PcmReader>;
    /// Release the device.  Safe to call more than once.
    fn stop(&mut self);
}

#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<Box<dyn AudioStream>, CaptureError>;
}

#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(Vec<u8>),
    /// Terminal event; no chunks follow.  Carries the media type actually
    /// produced when the encoder knows it.
    Flushed { mime_type: Option<String> },
}

pub trait EncoderHandle: Send {
    /// Ask the encoder to finalise.  Buffered chunks and the flush event
    /// still arrive on the event channel afterwards.
    fn request_stop(&mut self);
}

pub struct EncoderSession {
    pub handle: Box<dyn EncoderHandle>,
    pub events: mpsc::UnboundedReceiver<EncoderEvent>,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    async fn start(
        &self,
        stream: &mut dyn AudioStream,
        mime_type: &str,
        timeslice: Duration,
    ) -> Result<EncoderSession, CaptureError>;
}

/// Pick the best container the encoder can produce.
pub fn select_mime_type(encoder: &dyn Encoder) -> &'static str {
    MIME_PREFERENCE
        .iter()
        .copied()
        .find(|mime| encoder.is_type_supported(mime))
        .unwrap_or(FALLBACK_MIME)
}

/// The concatenated result of one capture.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub chunks: usize,
}

/// Resolves once the encoder has flushed its last chunk.
pub struct PendingPayload {
    rx: oneshot::Receiver<EncodedPayload>,
    mime_type: String,
}

impl PendingPayload {
    pub async fn wait(self) -> EncodedPayload {
        match self.rx.await {
            Ok(payload) => payload,
            Err(_) => {
                warn!("Chunk collector vanished before flushing – yielding an empty payload");
                EncodedPayload {
                    bytes: Vec::new(),
                    mime_type: self.mime_type,
                    chunks: 0,
                }
            }
        }
    }
}

struct ActiveCapture {
    stream: Box<dyn AudioStream>,
    encoder: Box<dyn EncoderHandle>,
    payload: oneshot::Receiver<EncodedPayload>,
    mime_type: String,
}

pub struct CaptureController {
    microphone: Arc<dyn Microphone>,
    encoder: Arc<dyn Encoder>,
    active: Option<ActiveCapture>,
}

impl CaptureController {
    pub fn new(microphone: Arc<dyn Microphone>, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            microphone,
            encoder,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open the microphone and start encoding.
    ///
    /// Returns `Ok(false)` without side effects when already recording.
    pub async fn start(&mut self) -> Result<bool, CaptureError> {
        if self.active.is_some() {
            debug!("start ignored – already recording");
            return Ok(false);
        }

        let mut stream = self.microphone.acquire(AudioConstraints::voice()).await?;
        let mime_type = select_mime_type(self.encoder.as_ref());

        let session = match self
            .encoder
            .start(stream.as_mut(), mime_type, CHUNK_INTERVAL)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                stream.stop();
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(collect_chunks(session.events, mime_type.to_string(), tx));

        info!(
            "Capture started ({mime_type}, {} Hz, {} ch)",
            stream.format().sample_rate,
            stream.format().channels
        );
        self.active = Some(ActiveCapture {
            stream,
            encoder: session.handle,
            payload: rx,
            mime_type: mime_type.to_string(),
        });
        Ok(true)
    }

    /// Finalise the encoder and release the microphone.
    ///
    /// Returns `None` when not recording.  The payload becomes available
    /// once the encoder flushes.
    pub fn stop(&mut self) -> Option<PendingPayload> {
        let mut active = self.active.take()?;
        active.encoder.request_stop();
        active.stream.stop();
        info!("Capture stopped – waiting for encoder flush");
        Some(PendingPayload {
            rx: active.payload,
            mime_type: active.mime_type,
        })
    }
}

/// Append chunks in arrival order until the encoder flushes (or its
/// channel closes), then hand the concatenated payload over.
async fn collect_chunks(
    mut events: mpsc::UnboundedReceiver<EncoderEvent>,
    selected_mime: String,
    done: oneshot::Sender<EncodedPayload>,
) {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut reported_mime = None;

    loop {
        match events.recv().await {
            Some(EncoderEvent::Chunk(chunk)) => {
                if !chunk.is_empty() {
                    chunks.push(chunk);
                }
            }
            Some(EncoderEvent::Flushed { mime_type }) => {
                reported_mime = mime_type;
                break;
            }
            None => {
                warn!("Encoder closed without a flush event – keeping {} chunk(s)", chunks.len());
                break;
            }
        }
    }

    let payload = EncodedPayload {
        chunks: chunks.len(),
        bytes: chunks.concat(),
        mime_type: reported_mime.unwrap_or(selected_mime),
    };
    debug!(
        "Encoder flushed: {} chunk(s), {} bytes",
        payload.chunks,
        payload.bytes.len()
    );
    let _ = done.send(payload);
}
