use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::AudioError;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_RETRIES: u32 = 200;

/// Bounded sample queue between the decoder and the device renderer.
///
/// Producers wait in short sleeps while the queue is full instead of dropping
/// audio, and give up with [`AudioError::BufferFull`] after a bounded number
/// of attempts.
#[derive(Debug)]
pub struct PlaybackQueue {
    samples: Mutex<VecDeque<i16>>,
    capacity: usize,
    retry_interval: Duration,
    max_retries: u32,
}

impl PlaybackQueue {
    /// `capacity_bytes` of 16-bit PCM.
    pub fn new(capacity_bytes: usize) -> Self {
        Self::with_retry(capacity_bytes, DEFAULT_RETRY_INTERVAL, DEFAULT_MAX_RETRIES)
    }

    pub fn with_retry(capacity_bytes: usize, retry_interval: Duration, max_retries: u32) -> Self {
        let capacity = (capacity_bytes / 2).max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            retry_interval,
            max_retries,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Append samples, waiting for room. A chunk larger than the whole queue
    /// is accepted once the queue has drained.
    pub fn push_blocking(&self, chunk: &[i16]) -> Result<(), AudioError> {
        let mut attempts = 0;
        loop {
            {
                let mut samples = self.lock();
                if samples.len() + chunk.len() <= self.capacity || samples.is_empty() {
                    samples.extend(chunk.iter().copied());
                    return Ok(());
                }
            }

            if attempts >= self.max_retries {
                log::warn!(
                    "⚠️ Playback queue full, dropping {} samples after {} retries",
                    chunk.len(),
                    attempts
                );
                return Err(AudioError::BufferFull);
            }
            attempts += 1;
            thread::sleep(self.retry_interval);
        }
    }

    /// Fill `out` with queued samples. Returns how many were real audio; the
    /// rest of `out` is left untouched.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut samples = self.lock();
        let n = out.len().min(samples.len());
        for (slot, sample) in out.iter_mut().zip(samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    /// Look at the sample `offset` places from the head without consuming it.
    pub fn peek(&self, offset: usize) -> Option<i16> {
        self.lock().get(offset).copied()
    }

    /// Remove up to `n` samples from the head.
    pub fn discard(&self, n: usize) {
        let mut samples = self.lock();
        let n = n.min(samples.len());
        samples.drain(..n);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<i16>> {
        self.samples.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_push_and_pop() {
        let queue = PlaybackQueue::new(16);
        assert_eq!(queue.capacity(), 8);
        queue.push_blocking(&[1, 2, 3]).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(1), Some(2));

        let mut out = [0i16; 5];
        assert_eq!(queue.pop_into(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_gives_up_after_retries() {
        let queue = PlaybackQueue::with_retry(8, Duration::from_millis(1), 3);
        queue.push_blocking(&[1, 2, 3, 4]).unwrap();
        let started = Instant::now();
        assert!(matches!(
            queue.push_blocking(&[5]),
            Err(AudioError::BufferFull)
        ));
        assert!(started.elapsed() >= Duration::from_millis(3));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_producer_waits_for_consumer() {
        let queue = Arc::new(PlaybackQueue::with_retry(8, Duration::from_millis(5), 200));
        queue.push_blocking(&[1, 2, 3, 4]).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.discard(2);
            })
        };

        queue.push_blocking(&[5, 6]).unwrap();
        consumer.join().unwrap();
        let mut out = [0i16; 4];
        assert_eq!(queue.pop_into(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn test_oversized_chunk_accepted_when_empty() {
        let queue = PlaybackQueue::with_retry(4, Duration::from_millis(1), 1);
        queue.push_blocking(&[0; 10]).unwrap();
        assert_eq!(queue.len(), 10);
        queue.clear();
        assert!(queue.is_empty());
    }
}
