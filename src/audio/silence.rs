use std::sync::atomic::{AtomicU32, Ordering};

/// Normalized RMS below which a buffer counts as silence.
pub const DEFAULT_SILENCE_THRESHOLD: f64 = 0.01;

/// Energy based voice activity detector keeping a running count of
/// consecutive silent buffers.
#[derive(Debug)]
pub struct SilenceDetector {
    threshold: f64,
    counter: AtomicU32,
}

impl Default for SilenceDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SILENCE_THRESHOLD)
    }
}

impl SilenceDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            counter: AtomicU32::new(0),
        }
    }

    /// Feed one buffer. Returns true if the buffer was silent.
    pub fn observe(&self, samples: &[i16]) -> bool {
        let silent = rms(samples) < self.threshold;
        if silent {
            self.counter.fetch_add(1, Ordering::AcqRel);
        } else {
            self.counter.store(0, Ordering::Release);
        }
        silent
    }

    /// Feed one buffer of little endian PCM bytes.
    pub fn observe_bytes(&self, pcm: &[u8]) -> bool {
        self.observe(&crate::codec::bytes_to_samples(pcm))
    }

    pub fn count(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }
}

/// Root mean square of the buffer normalized to [0, 1].
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| {
            let v = *s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt()
}
