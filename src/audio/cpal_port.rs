use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::broadcast;

use super::{AudioError, AudioPort, PlaybackQueue, SilenceDetector};
use crate::codec::{bytes_to_samples, samples_to_bytes, FrameSpec};
use crate::config::AudioSettings;

pub struct CpalPortConfig {
    /// Layout of published capture frames.
    pub capture: FrameSpec,
    /// Rate of the PCM handed to `enqueue_playback`.
    pub playback_sample_rate: u32,
    pub playback_capacity_bytes: usize,
}

impl CpalPortConfig {
    pub fn from_settings(settings: &AudioSettings, playback_capacity_bytes: usize) -> Self {
        Self {
            capture: settings.uplink(),
            playback_sample_rate: settings.output_sample_rate,
            playback_capacity_bytes,
        }
    }
}

enum PortCommand {
    StartCapture,
    StopCapture,
    Shutdown,
}

struct Shared {
    capturing: AtomicBool,
    silence: SilenceDetector,
    playback: PlaybackQueue,
    frames: broadcast::Sender<Vec<u8>>,
}

/// Default input and output devices driven from a dedicated thread, since
/// cpal streams cannot leave the thread that built them.
pub struct CpalAudioPort {
    shared: Arc<Shared>,
    commands: Sender<PortCommand>,
    closed: AtomicBool,
    audio_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalAudioPort {
    pub fn new(config: CpalPortConfig) -> Result<Self, AudioError> {
        log::debug!("AudioPort: Creating cpal audio port");
        let (frames, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            capturing: AtomicBool::new(false),
            silence: SilenceDetector::default(),
            playback: PlaybackQueue::new(config.playback_capacity_bytes),
            frames,
        });

        let (commands, command_rx) = channel();
        let (ready_tx, ready_rx) = channel();
        let thread_shared = Arc::clone(&shared);

        let audio_thread = thread::spawn(move || {
            let streams = match open_streams(&config, &thread_shared) {
                Ok(streams) => {
                    let _ = ready_tx.send(Ok(()));
                    streams
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let (input, output) = streams;

            while let Ok(command) = command_rx.recv() {
                match command {
                    PortCommand::StartCapture => {
                        if let Err(e) = input.play() {
                            log::error!("AudioPort: Failed to start input stream: {}", e);
                        }
                    }
                    PortCommand::StopCapture => {
                        if let Err(e) = input.pause() {
                            log::warn!("AudioPort: Failed to pause input stream: {}", e);
                        }
                    }
                    PortCommand::Shutdown => break,
                }
            }

            log::debug!("AudioPort: Audio thread exiting");
            drop(input);
            drop(output);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(AudioError::DeviceError(
                    "audio thread exited during setup".to_string(),
                ))
            }
        }

        log::info!("🎧 Audio devices ready");
        Ok(Self {
            shared,
            commands,
            closed: AtomicBool::new(false),
            audio_thread: Mutex::new(Some(audio_thread)),
        })
    }
}

fn open_streams(
    config: &CpalPortConfig,
    shared: &Arc<Shared>,
) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
    let host = cpal::default_host();
    log::debug!("AudioPort: Using audio host: {:?}", host.id());

    let input_device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceError("No input device found".to_string()))?;
    let output_device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?;

    let input = build_input(&input_device, config, Arc::clone(shared))?;
    // Capture stays paused until a listening turn starts
    if let Err(e) = input.pause() {
        log::debug!("AudioPort: Input stream cannot be paused: {}", e);
    }

    let output = build_output(&output_device, config, Arc::clone(shared))?;
    output
        .play()
        .map_err(|e| AudioError::DeviceError(e.to_string()))?;

    Ok((input, output))
}

fn build_input(
    device: &Device,
    config: &CpalPortConfig,
    shared: Arc<Shared>,
) -> Result<cpal::Stream, AudioError> {
    let uplink_rate = config.capture.sample_rate;
    let supported = select_input_config(device, uplink_rate)?;
    let stream_config = supported.config();

    log::info!(
        "Audio capture configured: {} channels @ {}Hz (format: {:?}, uplink {}Hz)",
        stream_config.channels,
        stream_config.sample_rate.0,
        supported.sample_format(),
        uplink_rate
    );

    let frame_len = config.capture.samples_per_channel();
    let resampler = Downsampler::new(stream_config.sample_rate.0, uplink_rate);
    match supported.sample_format() {
        SampleFormat::I16 => {
            capture_stream::<i16>(device, &stream_config, shared, frame_len, resampler)
        }
        SampleFormat::U16 => {
            capture_stream::<u16>(device, &stream_config, shared, frame_len, resampler)
        }
        SampleFormat::F32 => {
            capture_stream::<f32>(device, &stream_config, shared, frame_len, resampler)
        }
        other => Err(AudioError::DeviceError(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }
}

/// Pick the input configuration closest to the uplink rate. Devices that
/// cannot record at that rate are opened at 48 or 44.1 kHz and downsampled.
fn select_input_config(
    device: &Device,
    uplink_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| AudioError::DeviceError(format!("Failed to get input configs: {}", e)))?;

    let mut best: Option<(i32, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let min_rate = range.min_sample_rate().0;
        let max_rate = range.max_sample_rate().0;
        log::debug!(
            "AudioPort: Input config {:?} x{} @ {}-{}Hz",
            range.sample_format(),
            range.channels(),
            min_rate,
            max_rate
        );
        let Some((score, rate)) =
            score_input_range(min_rate, max_rate, range.sample_format(), uplink_rate)
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(current, _)| score > *current) {
            best = Some((score, range.with_sample_rate(cpal::SampleRate(rate))));
        }
    }

    match best {
        Some((_, config)) => Ok(config),
        None => {
            log::warn!("AudioPort: No usable input range listed, using the device default");
            Ok(device.default_input_config()?)
        }
    }
}

/// Score one supported input range and the rate to open it at. Formats the
/// capture callback cannot convert are skipped.
fn score_input_range(
    min_rate: u32,
    max_rate: u32,
    format: SampleFormat,
    uplink_rate: u32,
) -> Option<(i32, u32)> {
    let format_score = match format {
        SampleFormat::I16 => 50,
        SampleFormat::F32 => 25,
        SampleFormat::U16 => 0,
        _ => return None,
    };
    let supports = |rate: u32| min_rate <= rate && rate <= max_rate;
    let (rate_score, rate) = if supports(uplink_rate) {
        (1000, uplink_rate)
    } else if supports(48_000) {
        (500, 48_000)
    } else if supports(44_100) {
        (400, 44_100)
    } else {
        (100, max_rate)
    };
    Some((rate_score + format_score, rate))
}

/// Streaming linear interpolation from the device rate down to the uplink
/// rate. Keeps its position across callbacks so buffer edges line up.
struct Downsampler {
    step: f64,
    position: f64,
    previous: i16,
}

impl Downsampler {
    fn new(device_rate: u32, uplink_rate: u32) -> Self {
        Self {
            step: device_rate as f64 / uplink_rate as f64,
            // Index 0 is the last sample of the previous buffer
            position: 1.0,
            previous: 0,
        }
    }

    fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    fn process(&mut self, input: &[i16], out: &mut Vec<i16>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        let Some(&last) = input.last() else {
            return;
        };

        let at = |index: usize| {
            if index == 0 {
                self.previous
            } else {
                input[index - 1]
            }
        };
        let len = input.len() as f64;
        while self.position < len {
            let lo = self.position.floor() as usize;
            let fract = self.position - lo as f64;
            let a = at(lo) as f64;
            let b = at(lo + 1) as f64;
            out.push((a + (b - a) * fract).round() as i16);
            self.position += self.step;
        }
        self.position -= len;
        self.previous = last;
    }
}

fn capture_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    shared: Arc<Shared>,
    frame_len: usize,
    mut resampler: Downsampler,
) -> Result<cpal::Stream, AudioError>
where
    T: Sample + SizedSample + Send + Sync + 'static,
    i16: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<i16> = Vec::new();
    let mut pending: Vec<i16> = Vec::with_capacity(frame_len * 2);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // First channel only
            mono.clear();
            mono.extend(
                data.chunks(channels)
                    .filter_map(|frame| frame.first())
                    .map(|sample| i16::from_sample(*sample)),
            );
            resampler.process(&mono, &mut pending);

            while pending.len() >= frame_len {
                let frame: Vec<i16> = pending.drain(..frame_len).collect();
                if shared.capturing.load(Ordering::Acquire) {
                    shared.silence.observe(&frame);
                    let _ = shared.frames.send(samples_to_bytes(&frame));
                }
            }
        },
        move |err| {
            log::error!("AudioPort: Input stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

fn build_output(
    device: &Device,
    config: &CpalPortConfig,
    shared: Arc<Shared>,
) -> Result<cpal::Stream, AudioError> {
    let supported = device.default_output_config()?;
    log::debug!("AudioPort: Using output config: {:?}", supported);

    let output_rate = supported.sample_rate().0;
    let output_channels = supported.channels() as usize;
    let input_rate = config.playback_sample_rate;
    let step = input_rate as f32 / output_rate as f32;
    let mut scratch: Vec<i16> = Vec::new();

    let stream = device.build_output_stream(
        &supported.config(),
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let output_frames = data.len() / output_channels;
            let needed = (output_frames as f32 * step).ceil() as usize;
            scratch.resize(needed, 0);
            let available = shared.playback.pop_into(&mut scratch);

            // Linear interpolation from the downlink rate to the device rate
            let mut position: f32 = 0.0;
            for frame in data.chunks_mut(output_channels) {
                let sample = if available == 0 {
                    0.0
                } else {
                    let lo = position.floor() as usize;
                    let fract = position.fract();
                    let s1 = scratch.get(lo).filter(|_| lo < available).copied();
                    let s2 = scratch.get(lo + 1).filter(|_| lo + 1 < available).copied();
                    match (s1, s2) {
                        (Some(a), Some(b)) => {
                            to_f32(a) * (1.0 - fract) + to_f32(b) * fract
                        }
                        (Some(a), None) => to_f32(a),
                        _ => 0.0,
                    }
                };
                for channel in frame.iter_mut() {
                    *channel = sample;
                }
                position += step;
            }
        },
        move |err| {
            log::error!("AudioPort: Output stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

fn to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

impl AudioPort for CpalAudioPort {
    fn start_capture(&self) -> Result<(), AudioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AudioError::Closed);
        }
        self.shared.silence.reset();
        self.shared.capturing.store(true, Ordering::Release);
        self.commands
            .send(PortCommand::StartCapture)
            .map_err(|e| AudioError::CaptureError(e.to_string()))
    }

    fn stop_capture(&self) -> Result<(), AudioError> {
        self.shared.capturing.store(false, Ordering::Release);
        self.shared.silence.reset();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.commands
            .send(PortCommand::StopCapture)
            .map_err(|e| AudioError::CaptureError(e.to_string()))
    }

    fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.frames.subscribe()
    }

    fn enqueue_playback(&self, pcm: &[u8]) -> Result<(), AudioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AudioError::Closed);
        }
        self.shared.playback.push_blocking(&bytes_to_samples(pcm))
    }

    fn clear_playback(&self) {
        self.shared.playback.clear();
    }

    fn silence_counter(&self) -> u32 {
        self.shared.silence.count()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.capturing.store(false, Ordering::Release);
        self.shared.playback.clear();
        if let Err(e) = self.commands.send(PortCommand::Shutdown) {
            log::error!("Failed to send shutdown command: {}", e);
        }
        let handle = self
            .audio_thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(thread) = handle {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}

impl Drop for CpalAudioPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}
