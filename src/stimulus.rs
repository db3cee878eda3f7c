//! Stimulus decoding and playback primitives.
//!
//! The session only needs to know when a stimulus is playable, how long it
//! is, and how to start, pause and rewind it. `WavDecoder` reads the duration
//! from a RIFF header and hands back a `LoggingPlayback`, which is enough to
//! run the game headless. A real audio sink implements `Playback` instead.

use crate::protocol::StimulusPayload;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type StimulusResult<T> = Result<T, StimulusError>;

#[derive(Debug, thiserror::Error)]
pub enum StimulusError {
    #[error("stimulus payload is not valid base64: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    #[error("unsupported stimulus: {0}")]
    Unsupported(String),

    #[error("stimulus data truncated")]
    Truncated,

    #[error("failed to read stimulus file: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded, playable stimulus
pub trait Playback: Send + Sync {
    /// Total playable length
    fn duration(&self) -> Duration;

    fn start(&self);

    fn pause(&self);

    /// Rewind to the beginning
    fn reset(&self) {
        self.set_position(Duration::ZERO);
    }

    fn set_position(&self, position: Duration);
}

/// Turns an encoded payload into something playable
#[async_trait]
pub trait StimulusDecoder: Send + Sync {
    async fn decode(&self, payload: &StimulusPayload) -> StimulusResult<Arc<dyn Playback>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Paused,
    Reset,
    Seek(Duration),
}

/// Playback that logs transitions instead of producing sound
#[derive(Debug)]
pub struct LoggingPlayback {
    label: String,
    duration: Duration,
    events: Mutex<Vec<PlaybackEvent>>,
}

impl LoggingPlayback {
    pub fn new(label: impl Into<String>, duration: Duration) -> Self {
        Self {
            label: label.into(),
            duration,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Every transition seen so far, oldest first
    pub fn events(&self) -> Vec<PlaybackEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn record(&self, event: PlaybackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Playback for LoggingPlayback {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn start(&self) {
        tracing::info!("♪ {} playing", self.label);
        self.record(PlaybackEvent::Started);
    }

    fn pause(&self) {
        tracing::info!("♪ {} stopped", self.label);
        self.record(PlaybackEvent::Paused);
    }

    fn reset(&self) {
        self.record(PlaybackEvent::Reset);
    }

    fn set_position(&self, position: Duration) {
        self.record(PlaybackEvent::Seek(position));
    }
}

/// Decoder for PCM WAV files
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

#[async_trait]
impl StimulusDecoder for WavDecoder {
    async fn decode(&self, payload: &StimulusPayload) -> StimulusResult<Arc<dyn Playback>> {
        if !is_wav_mime(&payload.mime) {
            return Err(StimulusError::Unsupported(payload.mime.clone()));
        }
        let bytes = payload.to_bytes()?;
        let duration = wav_duration(&bytes)?;
        tracing::debug!("Decoded {} byte WAV stimulus ({:?})", bytes.len(), duration);
        Ok(Arc::new(LoggingPlayback::new("stimulus", duration)))
    }
}

fn is_wav_mime(mime: &str) -> bool {
    matches!(mime, "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave")
}

fn read_u32(bytes: &[u8], at: usize) -> StimulusResult<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(StimulusError::Truncated)
}

/// Playable length of a RIFF/WAVE file, from its `fmt ` and `data` chunks
pub fn wav_duration(bytes: &[u8]) -> StimulusResult<Duration> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(StimulusError::Unsupported("not a RIFF/WAVE file".to_string()));
    }

    let mut byte_rate = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4)? as usize;
        let body = offset + 8;

        match id {
            b"fmt " => {
                byte_rate = Some(read_u32(bytes, body + 8)?);
            }
            b"data" => {
                let rate = match byte_rate {
                    Some(0) | None => {
                        return Err(StimulusError::Unsupported(
                            "missing or empty fmt chunk".to_string(),
                        ))
                    }
                    Some(rate) => rate,
                };
                // Streamed files may carry a placeholder size; trust what is present
                let available = bytes.len() - body;
                let data_len = size.min(available);
                return Ok(Duration::from_secs_f64(data_len as f64 / rate as f64));
            }
            _ => {}
        }

        // Chunks are padded to an even length
        offset = body + size + (size & 1);
    }

    Err(StimulusError::Truncated)
}

/// Read a stimulus file and guess its MIME type from the extension
pub async fn load_stimulus_file(path: impl AsRef<Path>) -> StimulusResult<StimulusPayload> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") | Some("wave") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    };
    Ok(StimulusPayload::from_bytes(mime, &bytes))
}

/// Build a silent mono 16-bit PCM WAV file of the given length
pub fn silent_wav(sample_rate: u32, duration: Duration) -> Vec<u8> {
    let block_align: u16 = 2;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = (duration.as_secs_f64() * byte_rate as f64) as u32 & !1;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}
