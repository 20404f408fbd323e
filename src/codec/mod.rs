//! Codec adapter between raw 16-bit PCM frames and compressed frames.

#[cfg(feature = "opus")]
pub mod opus;

use std::sync::Mutex;
use thiserror::Error;

#[cfg(feature = "opus")]
pub use self::opus::OpusCodec;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    Init(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Fixed frame contract shared by both directions of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl FrameSpec {
    pub const fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            frame_duration_ms,
        }
    }

    pub fn samples_per_channel(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }

    /// Size in bytes of one frame of 16-bit little endian PCM.
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }

    pub fn with_sample_rate(self, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..self
        }
    }
}

/// A frame codec. Implementations may keep state between calls and are
/// expected to rebuild it when the frame rate or channel count changes.
pub trait AudioCodec: Send {
    /// Short format name announced in the session hello.
    fn format(&self) -> &'static str;

    /// Encode exactly one frame of samples.
    fn encode(&mut self, pcm: &[i16], spec: FrameSpec) -> Result<Vec<u8>, CodecError>;

    /// Decode one compressed frame into interleaved samples.
    fn decode(&mut self, frame: &[u8], spec: FrameSpec) -> Result<Vec<i16>, CodecError>;
}

/// Stateless pass-through codec carrying raw little endian PCM.
#[derive(Debug, Default)]
pub struct PcmCodec;

impl AudioCodec for PcmCodec {
    fn format(&self) -> &'static str {
        "pcm"
    }

    fn encode(&mut self, pcm: &[i16], _spec: FrameSpec) -> Result<Vec<u8>, CodecError> {
        Ok(samples_to_bytes(pcm))
    }

    fn decode(&mut self, frame: &[u8], _spec: FrameSpec) -> Result<Vec<i16>, CodecError> {
        if frame.len() % 2 != 0 {
            return Err(CodecError::Decode(format!(
                "odd PCM frame length {}",
                frame.len()
            )));
        }
        Ok(bytes_to_samples(frame))
    }
}

/// Shared, thread safe front of an [`AudioCodec`].
///
/// Never fails: input frames are padded or truncated to the frame size, and
/// codec errors are logged and turned into empty output.
pub struct CodecAdapter {
    codec: Mutex<Box<dyn AudioCodec>>,
    format: &'static str,
}

impl CodecAdapter {
    pub fn new(codec: Box<dyn AudioCodec>) -> Self {
        let format = codec.format();
        Self {
            codec: Mutex::new(codec),
            format,
        }
    }

    pub fn pcm() -> Self {
        Self::new(Box::new(PcmCodec))
    }

    /// Opus when compiled in, raw PCM otherwise.
    pub fn preferred() -> Self {
        #[cfg(feature = "opus")]
        {
            Self::new(Box::new(OpusCodec::new()))
        }
        #[cfg(not(feature = "opus"))]
        {
            log::warn!("⚠️ Built without the opus feature, streaming raw PCM");
            Self::pcm()
        }
    }

    pub fn format(&self) -> &'static str {
        self.format
    }

    /// Encode one frame of little endian PCM bytes.
    pub fn encode(&self, pcm: &[u8], spec: FrameSpec) -> Vec<u8> {
        let frame = normalize_frame(pcm, spec);
        let samples = bytes_to_samples(&frame);
        let mut codec = self.codec.lock().unwrap_or_else(|p| p.into_inner());
        match codec.encode(&samples, spec) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("❌ Failed to encode audio frame: {}", e);
                Vec::new()
            }
        }
    }

    /// Decode one compressed frame into little endian PCM bytes.
    pub fn decode(&self, frame: &[u8], spec: FrameSpec) -> Vec<u8> {
        let mut codec = self.codec.lock().unwrap_or_else(|p| p.into_inner());
        match codec.decode(frame, spec) {
            Ok(samples) => samples_to_bytes(&samples),
            Err(e) => {
                log::warn!("⚠️ Dropping undecodable audio frame: {}", e);
                Vec::new()
            }
        }
    }
}

/// Pad with silence or truncate so the frame is exactly one frame long.
pub fn normalize_frame(pcm: &[u8], spec: FrameSpec) -> Vec<u8> {
    let expected = spec.frame_bytes();
    let mut frame = pcm[..pcm.len().min(expected)].to_vec();
    frame.resize(expected, 0);
    frame
}

pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
