use ::opus::{Application, Channels, Decoder, Encoder};

use super::{AudioCodec, CodecError, FrameSpec};

/// Largest packet a single frame may encode to.
const MAX_PACKET_BYTES: usize = 4000;
/// 120 ms at 48 kHz, the longest frame Opus can produce.
const MAX_FRAME_SAMPLES: usize = 5760;

/// libopus codec. Encoder and decoder are created lazily and rebuilt when the
/// sample rate or channel count changes.
#[derive(Default)]
pub struct OpusCodec {
    encoder: Option<(FrameSpec, Encoder)>,
    decoder: Option<(FrameSpec, Decoder)>,
}

impl OpusCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&mut self, spec: FrameSpec) -> Result<&mut Encoder, CodecError> {
        let stale = !matches!(&self.encoder, Some((current, _)) if same_stream(current, &spec));
        if stale {
            log::debug!(
                "🔧 Creating Opus encoder for {}Hz x{}",
                spec.sample_rate,
                spec.channels
            );
            let encoder = Encoder::new(spec.sample_rate, channels(spec)?, Application::Voip)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            self.encoder = Some((spec, encoder));
        }
        match self.encoder.as_mut() {
            Some((_, encoder)) => Ok(encoder),
            None => Err(CodecError::Init("encoder unavailable".to_string())),
        }
    }

    fn decoder(&mut self, spec: FrameSpec) -> Result<&mut Decoder, CodecError> {
        let stale = !matches!(&self.decoder, Some((current, _)) if same_stream(current, &spec));
        if stale {
            log::debug!(
                "🔧 Creating Opus decoder for {}Hz x{}",
                spec.sample_rate,
                spec.channels
            );
            let decoder = Decoder::new(spec.sample_rate, channels(spec)?)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            self.decoder = Some((spec, decoder));
        }
        match self.decoder.as_mut() {
            Some((_, decoder)) => Ok(decoder),
            None => Err(CodecError::Init("decoder unavailable".to_string())),
        }
    }
}

impl AudioCodec for OpusCodec {
    fn format(&self) -> &'static str {
        "opus"
    }

    fn encode(&mut self, pcm: &[i16], spec: FrameSpec) -> Result<Vec<u8>, CodecError> {
        let encoder = self.encoder(spec)?;
        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let len = encoder
            .encode(pcm, &mut packet)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        packet.truncate(len);
        Ok(packet)
    }

    fn decode(&mut self, frame: &[u8], spec: FrameSpec) -> Result<Vec<i16>, CodecError> {
        let channel_count = spec.channels as usize;
        let decoder = self.decoder(spec)?;
        let capacity = spec.samples_per_channel().max(MAX_FRAME_SAMPLES) * channel_count;
        let mut samples = vec![0i16; capacity];
        let decoded = decoder
            .decode(frame, &mut samples, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        samples.truncate(decoded * channel_count);
        Ok(samples)
    }
}

fn same_stream(a: &FrameSpec, b: &FrameSpec) -> bool {
    a.sample_rate == b.sample_rate && a.channels == b.channels
}

fn channels(spec: FrameSpec) -> Result<Channels, CodecError> {
    match spec.channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(CodecError::Init(format!(
            "unsupported channel count {}",
            other
        ))),
    }
}
