//! Native capture devices – `arecord` for the microphone and `ffmpeg` for
//! the encoder, both run as child processes.
//!
//! `arecord` writes raw S16_LE PCM to its stdout; a pump task copies that
//! into `ffmpeg`'s stdin, and `ffmpeg` writes the container to its stdout.
//! Closing `ffmpeg`'s stdin makes it finalise the container and exit.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{
    AudioConstraints, AudioStream, CaptureError, Encoder, EncoderEvent, EncoderHandle,
    EncoderSession, Microphone, PcmFormat, PcmReader,
};

/// How long a freshly spawned `arecord` gets to fail on a bad device.
const SETTLE: Duration = Duration::from_millis(500);

/// Re-emit a child's stderr as `warn!` lines so device errors show up in
/// the log and the pipe never fills up and blocks the child.
pub(crate) fn drain_stderr(tool: &'static str, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                warn!("[{tool}] {line}");
            }
        }
        debug!("{tool} stderr stream ended");
    });
}

// ── microphone via arecord ───────────────────────────────────────────────

pub struct ArecordMicrophone {
    device: Option<String>,
    format: PcmFormat,
}

impl ArecordMicrophone {
    pub fn new(device: Option<String>, format: PcmFormat) -> Self {
        Self { device, format }
    }
}

#[async_trait]
impl Microphone for ArecordMicrophone {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<Box<dyn AudioStream>, CaptureError> {
        let mut cmd = Command::new("arecord");
        cmd.args([
            "-q",
            "-f",
            "S16_LE",
            &format!("-c{}", self.format.channels),
            &format!("-r{}", self.format.sample_rate),
            "-t",
            "raw",
        ]);
        if let Some(card) = &self.device {
            cmd.args(["-D", card]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied(e.to_string()),
            std::io::ErrorKind::NotFound => {
                CaptureError::DeviceUnavailable("arecord not found (install alsa-utils)".into())
            }
            _ => CaptureError::DeviceUnavailable(format!("cannot spawn arecord: {e}")),
        })?;

        tokio::time::sleep(SETTLE).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(classify_arecord_failure(&stderr, &status.to_string()));
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check arecord status: {e}"),
        }

        if let Some(stderr) = child.stderr.take() {
            drain_stderr("arecord", stderr);
        }
        let stdout = child.stdout.take();

        info!(
            "arecord started (pid={:?}, channels={}, rate={}, card={:?})",
            child.id(),
            self.format.channels,
            self.format.sample_rate,
            self.device
        );

        Ok(Box::new(ArecordStream {
            child,
            stdout,
            format: self.format,
            constraints,
        }))
    }
}

fn classify_arecord_failure(stderr: &str, status: &str) -> CaptureError {
    let detail = match stderr.trim() {
        "" => format!("arecord exited immediately with {status}"),
        msg => msg.to_string(),
    };
    if stderr.to_ascii_lowercase().contains("permission denied") {
        CaptureError::PermissionDenied(detail)
    } else {
        CaptureError::DeviceUnavailable(format!(
            "{detail} – check REC_CARD in memo.conf (run 'arecord -l' to list capture devices)"
        ))
    }
}

struct ArecordStream {
    child: Child,
    stdout: Option<ChildStdout>,
    format: PcmFormat,
    constraints: AudioConstraints,
}

impl AudioStream for ArecordStream {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn constraints(&self) -> AudioConstraints {
        self.constraints
    }

    fn take_reader(&mut self) -> Option<PcmReader> {
        self.stdout.take().map(|s| Box::new(s) as PcmReader)
    }

    fn stop(&mut self) {
        match self.child.start_kill() {
            Ok(()) => debug!("arecord stopped"),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => warn!("Cannot stop arecord: {e}"),
        }
    }
}

// ── encoder via ffmpeg ───────────────────────────────────────────────────

/// How a media type maps onto ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FfmpegTarget {
    muxer: &'static str,
    codec: &'static str,
}

fn target_for(mime_type: &str) -> Option<FfmpegTarget> {
    let mime = mime_type.to_ascii_lowercase();
    let base = mime.split(';').next().unwrap_or("").trim();
    match base {
        "audio/mp4" => Some(FfmpegTarget {
            muxer: "mp4",
            codec: "aac",
        }),
        "audio/webm" => Some(FfmpegTarget {
            muxer: "webm",
            codec: "libopus",
        }),
        "audio/ogg" => Some(FfmpegTarget {
            muxer: "ogg",
            codec: "libopus",
        }),
        _ => None,
    }
}

/// Muxer or encoder names from `ffmpeg -muxers` / `ffmpeg -encoders`.
///
/// Both listings have a legend, a dashed separator, then one entry per
/// line: a flags column followed by the (possibly comma-joined) name.
fn parse_listing(text: &str) -> HashSet<String> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("--"))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _flags = cols.next()?;
            cols.next()
        })
        .flat_map(|names| names.split(',').map(str::to_string).collect::<Vec<_>>())
        .collect()
}

async fn ffmpeg_listing(flag: &str) -> Result<HashSet<String>> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", flag])
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run ffmpeg {flag} (is ffmpeg installed?)"))?;
    if !output.status.success() {
        anyhow::bail!("ffmpeg {flag} exited with {}", output.status);
    }
    Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
}

pub struct FfmpegEncoder {
    muxers: HashSet<String>,
    codecs: HashSet<String>,
}

impl FfmpegEncoder {
    /// Ask the installed ffmpeg which muxers and encoders it has.
    pub async fn probe() -> Result<Self> {
        let muxers = ffmpeg_listing("-muxers").await?;
        let codecs = ffmpeg_listing("-encoders").await?;
        info!(
            "ffmpeg probed: {} muxers, {} encoders",
            muxers.len(),
            codecs.len()
        );
        Ok(Self { muxers, codecs })
    }

    fn filters(constraints: AudioConstraints) -> Vec<&'static str> {
        if constraints.echo_cancellation {
            debug!("Echo cancellation requested but not available through ffmpeg – skipped");
        }
        let mut filters = Vec::new();
        if constraints.noise_suppression {
            filters.push("afftdn");
        }
        if constraints.auto_gain_control {
            filters.push("dynaudnorm");
        }
        filters
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        target_for(mime_type)
            .map(|t| self.muxers.contains(t.muxer) && self.codecs.contains(t.codec))
            .unwrap_or(false)
    }

    async fn start(
        &self,
        stream: &mut dyn AudioStream,
        mime_type: &str,
        timeslice: Duration,
    ) -> Result<EncoderSession, CaptureError> {
        let target = target_for(mime_type)
            .ok_or_else(|| CaptureError::EncoderFailed(format!("no ffmpeg mapping for {mime_type}")))?;
        let mut reader = stream
            .take_reader()
            .ok_or_else(|| CaptureError::EncoderFailed("microphone stream already consumed".into()))?;
        let format = stream.format();

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd.args([
            "-f",
            "s16le",
            "-ar",
            &format.sample_rate.to_string(),
            "-ac",
            &format.channels.to_string(),
            "-i",
            "pipe:0",
            "-vn",
        ]);
        let filters = Self::filters(stream.constraints());
        if !filters.is_empty() {
            cmd.args(["-af", &filters.join(",")]);
        }
        cmd.args(["-c:a", target.codec]);
        if target.muxer == "mp4" {
            // stdout is not seekable; fragmented MP4 needs no trailing moov.
            cmd.args(["-movflags", "frag_keyframe+empty_moov+default_base_moof"]);
        }
        cmd.args(["-f", target.muxer, "pipe:1"]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::EncoderFailed(format!("cannot spawn ffmpeg: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::EncoderFailed("ffmpeg stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::EncoderFailed("ffmpeg stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr("ffmpeg", stderr);
        }

        let pump = tokio::spawn(async move {
            match tokio::io::copy(&mut reader, &mut stdin).await {
                Ok(n) => debug!("PCM pump finished after {n} bytes"),
                Err(e) => debug!("PCM pump ended: {e}"),
            }
            // Dropping stdin here is what lets ffmpeg finalise.
        });

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(read_chunks(child, stdout, timeslice, mime_type.to_string(), tx));

        info!(
            "ffmpeg encoding {mime_type} ({} / {})",
            target.muxer, target.codec
        );
        Ok(EncoderSession {
            handle: Box::new(FfmpegHandle { pump: Some(pump) }),
            events,
        })
    }
}

struct FfmpegHandle {
    pump: Option<JoinHandle<()>>,
}

impl EncoderHandle for FfmpegHandle {
    fn request_stop(&mut self) {
        // Aborting the pump drops ffmpeg's stdin → EOF → trailer written.
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Collect ffmpeg output and emit it as one chunk per `timeslice`.
async fn read_chunks(
    mut child: Child,
    mut stdout: ChildStdout,
    timeslice: Duration,
    mime_type: String,
    tx: mpsc::UnboundedSender<EncoderEvent>,
) {
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) => {
                    warn!("Reading ffmpeg output failed: {e}");
                    break;
                }
            },
            _ = ticks.tick() => {
                if !pending.is_empty() {
                    let _ = tx.send(EncoderEvent::Chunk(std::mem::take(&mut pending)));
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(EncoderEvent::Chunk(pending));
    }
    match child.wait().await {
        Ok(status) if status.success() => debug!("ffmpeg exited cleanly"),
        Ok(status) => warn!("ffmpeg exited with {status}"),
        Err(e) => warn!("Cannot wait for ffmpeg: {e}"),
    }
    let _ = tx.send(EncoderEvent::Flushed {
        mime_type: Some(mime_type),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUXERS: &str = "\
File formats:
 D. = Demuxing supported
 .E = Muxing supported
 --
  E mp4             MP4 (MPEG-4 Part 14)
  E ogg             Ogg
  E webm            WebM
";

    const ENCODERS: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 ------
 A....D aac                  AAC (Advanced Audio Coding)
 A..... libopus              libopus Opus
 V....D libx264              libx264 H.264
";

    #[test]
    fn test_parse_listing() {
        let muxers = parse_listing(MUXERS);
        assert!(muxers.contains("mp4"));
        assert!(muxers.contains("webm"));
        assert!(!muxers.contains("Demuxing"));
        let codecs = parse_listing(ENCODERS);
        assert!(codecs.contains("aac"));
        assert!(codecs.contains("libopus"));
    }

    #[test]
    fn test_supported_types_need_muxer_and_codec() {
        let encoder = FfmpegEncoder {
            muxers: parse_listing(MUXERS),
            codecs: ["aac".to_string()].into_iter().collect(),
        };
        assert!(encoder.is_type_supported("audio/mp4"));
        assert!(!encoder.is_type_supported("audio/webm;codecs=opus"));
        assert!(!encoder.is_type_supported("audio/wav"));
    }

    #[test]
    fn test_target_for_ignores_parameters() {
        assert_eq!(target_for("audio/ogg;codecs=opus").unwrap().muxer, "ogg");
        assert_eq!(target_for("audio/webm").unwrap().codec, "libopus");
        assert!(target_for("audio/flac").is_none());
    }

    #[test]
    fn test_filters_follow_constraints() {
        assert_eq!(
            FfmpegEncoder::filters(AudioConstraints::voice()),
            vec!["afftdn", "dynaudnorm"]
        );
        let none = AudioConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        };
        assert!(FfmpegEncoder::filters(none).is_empty());
    }

    #[test]
    fn test_classify_arecord_failure() {
        let err = classify_arecord_failure("arecord: main:830: audio open error: Permission denied", "exit 1");
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        let err = classify_arecord_failure("audio open error: No such file or directory", "exit 1");
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        let err = classify_arecord_failure("", "exit status: 1");
        assert!(err.to_string().contains("exited immediately"));
    }
}
