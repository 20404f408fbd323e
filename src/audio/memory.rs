use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::{AudioError, AudioPort, PlaybackQueue, SilenceDetector};
use crate::codec::bytes_to_samples;

/// In-process audio port. Capture frames are pushed by the caller and
/// playback accumulates in a queue that can be drained and inspected.
///
/// Used by embedders that feed audio themselves and by tests.
pub struct MemoryAudioPort {
    capturing: AtomicBool,
    closed: AtomicBool,
    silence: SilenceDetector,
    playback: PlaybackQueue,
    frames: broadcast::Sender<Vec<u8>>,
}

impl MemoryAudioPort {
    pub fn new(playback_capacity_bytes: usize) -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            capturing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            silence: SilenceDetector::default(),
            playback: PlaybackQueue::new(playback_capacity_bytes),
            frames,
        }
    }

    /// Simulate one captured buffer. Ignored unless capture is running.
    pub fn push_capture(&self, pcm: &[u8]) -> bool {
        if !self.capturing.load(Ordering::Acquire) {
            return false;
        }
        self.silence.observe_bytes(pcm);
        // No subscribers is fine
        let _ = self.frames.send(pcm.to_vec());
        true
    }

    /// Take everything queued for playback.
    pub fn drain_playback(&self) -> Vec<i16> {
        let mut out = vec![0i16; self.playback.len()];
        let n = self.playback.pop_into(&mut out);
        out.truncate(n);
        out
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl AudioPort for MemoryAudioPort {
    fn start_capture(&self) -> Result<(), AudioError> {
        if self.is_closed() {
            return Err(AudioError::Closed);
        }
        self.silence.reset();
        self.capturing.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), AudioError> {
        self.capturing.store(false, Ordering::Release);
        self.silence.reset();
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frames.subscribe()
    }

    fn enqueue_playback(&self, pcm: &[u8]) -> Result<(), AudioError> {
        if self.is_closed() {
            return Err(AudioError::Closed);
        }
        self.playback.push_blocking(&bytes_to_samples(pcm))
    }

    fn clear_playback(&self) {
        self.playback.clear();
    }

    fn silence_counter(&self) -> u32 {
        self.silence.count()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.capturing.store(false, Ordering::Release);
        self.playback.clear();
    }
}
