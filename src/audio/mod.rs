pub mod cpal_port;
pub mod memory;
pub mod playback;
pub mod silence;

use thiserror::Error;
use tokio::sync::broadcast;

pub use cpal_port::{CpalAudioPort, CpalPortConfig};
pub use memory::MemoryAudioPort;
pub use playback::PlaybackQueue;
pub use silence::SilenceDetector;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Failed to start capture: {0}")]
    CaptureError(String),

    #[error("Buffer full")]
    BufferFull,

    #[error("Audio port is shut down")]
    Closed,
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

/// Microphone and speaker as seen by the turn engine.
///
/// Captured audio is published as frames of 16-bit little endian mono PCM at
/// the uplink rate, one frame per buffer. Playback takes PCM at the downlink
/// rate.
pub trait AudioPort: Send + Sync {
    /// Begin publishing captured frames. Resets the silence counter.
    fn start_capture(&self) -> Result<(), AudioError>;

    /// Stop publishing captured frames. Resets the silence counter.
    fn stop_capture(&self) -> Result<(), AudioError>;

    fn is_capturing(&self) -> bool;

    /// Subscribe to captured frames.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Queue PCM for playback. May block briefly while the queue is full, so
    /// call it from a blocking context.
    fn enqueue_playback(&self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Drop everything still waiting to be played.
    fn clear_playback(&self);

    /// Consecutive silent capture buffers since capture started.
    fn silence_counter(&self) -> u32;

    /// Release the devices. Idempotent.
    fn shutdown(&self);
}
