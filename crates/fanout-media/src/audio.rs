//! Built-in audio codecs and PCM helpers
//!
//! G.711 (PCMU/PCMA) is implemented directly; Opus goes through libopus when
//! the `opus` feature is enabled.

use bytes::Bytes;
use fanout_protocol::Codec;

use crate::codec::{AudioFrame, DecodedFrame, Decoder, EncodedPayload, Encoder};
use crate::error::CodecError;
use crate::packet::MediaPacket;

/// G.711 sample rate
pub const G711_SAMPLE_RATE: u32 = 8_000;

/// Opus is always decoded and encoded at 48 kHz
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// 20 ms at 48 kHz
pub const OPUS_FRAME_SIZE: usize = 960;

const QUANT_MASK: u8 = 0x0f;
const SEG_MASK: u8 = 0x70;
const SEG_SHIFT: u8 = 4;
const SIGN_BIT: u8 = 0x80;
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

const SEG_ULAW_END: [i32; 8] = [0x3f, 0x7f, 0xff, 0x1ff, 0x3ff, 0x7ff, 0xfff, 0x1fff];
const SEG_ALAW_END: [i32; 8] = [0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff, 0x7ff, 0xfff];

fn segment(value: i32, table: &[i32; 8]) -> usize {
    table.iter().position(|&end| value <= end).unwrap_or(table.len())
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let mask: u8 = if pcm < 0 {
        pcm = -pcm;
        0x7f
    } else {
        0xff
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &SEG_ULAW_END);
    if seg >= 8 {
        return 0x7f ^ mask;
    }
    let value = ((seg as u8) << 4) | ((pcm >> (seg + 1)) as u8 & QUANT_MASK);
    value ^ mask
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let mut t = (((u & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= (u & SEG_MASK) >> SEG_SHIFT;
    let value = if u & SIGN_BIT != 0 { ULAW_BIAS - t } else { t - ULAW_BIAS };
    value as i16
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask: u8 = if pcm >= 0 {
        0xd5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &SEG_ALAW_END);
    if seg >= 8 {
        return 0x7f ^ mask;
    }
    let mut value = (seg as u8) << SEG_SHIFT;
    value |= if seg < 2 {
        (pcm >> 1) as u8 & QUANT_MASK
    } else {
        (pcm >> seg) as u8 & QUANT_MASK
    };
    value ^ mask
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let mut t = ((a & QUANT_MASK) as i32) << 4;
    let seg = (a & SEG_MASK) >> SEG_SHIFT;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    let value = if a & SIGN_BIT != 0 { t } else { -t };
    value as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    MuLaw,
    ALaw,
}

impl G711Law {
    fn codec(&self) -> Codec {
        match self {
            G711Law::MuLaw => Codec::Pcmu,
            G711Law::ALaw => Codec::Pcma,
        }
    }
}

pub struct G711Decoder {
    law: G711Law,
}

impl G711Decoder {
    pub fn new(law: G711Law) -> Self {
        Self { law }
    }
}

impl Decoder for G711Decoder {
    fn codec(&self) -> Codec {
        self.law.codec()
    }

    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>, CodecError> {
        if packet.payload().is_empty() {
            return Err(CodecError::Decode("empty G.711 payload".into()));
        }
        let expand = match self.law {
            G711Law::MuLaw => ulaw_to_linear,
            G711Law::ALaw => alaw_to_linear,
        };
        Ok(Some(DecodedFrame::Audio(AudioFrame {
            samples: packet.payload().iter().map(|&b| expand(b)).collect(),
            sample_rate: G711_SAMPLE_RATE,
            channels: 1,
        })))
    }
}

pub struct G711Encoder {
    law: G711Law,
}

impl G711Encoder {
    pub fn new(law: G711Law) -> Self {
        Self { law }
    }
}

impl Encoder for G711Encoder {
    fn codec(&self) -> Codec {
        self.law.codec()
    }

    fn encode(&mut self, frame: &DecodedFrame) -> Result<Vec<EncodedPayload>, CodecError> {
        let DecodedFrame::Audio(audio) = frame else {
            return Err(CodecError::Encode("G.711 encoder fed a video frame".into()));
        };
        let mono = downmix(&audio.samples, audio.channels);
        let pcm = resample(&mono, audio.sample_rate, G711_SAMPLE_RATE);
        let compress = match self.law {
            G711Law::MuLaw => linear_to_ulaw,
            G711Law::ALaw => linear_to_alaw,
        };
        let payload: Bytes = pcm.iter().map(|&s| compress(s)).collect::<Vec<u8>>().into();
        Ok(vec![EncodedPayload {
            payload,
            marker: false,
        }])
    }
}

/// Average interleaved channels down to mono
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
        .collect()
}

/// Duplicate a mono signal into `channels` interleaved channels
pub fn upmix(mono: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(channels))
        .collect()
}

/// Linear-interpolation resampler for mono PCM
pub fn resample(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let from = from_rate as u64;
    let to = to_rate as u64;
    let out_len = (input.len() as u64 * to / from) as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as u64 * from;
            let idx = (pos / to) as usize;
            let frac = (pos % to) as i64;
            let a = input[idx.min(last)] as i64;
            let b = input[(idx + 1).min(last)] as i64;
            (a + (b - a) * frac / to as i64) as i16
        })
        .collect()
}

#[cfg(feature = "opus")]
pub use self::opus_codec::{OpusDecoder, OpusEncoder};

#[cfg(feature = "opus")]
mod opus_codec {
    use super::*;

    /// Largest frame libopus can return (120 ms at 48 kHz)
    const MAX_FRAME_SIZE: usize = 5760;

    pub struct OpusDecoder {
        decoder: opus::Decoder,
    }

    impl OpusDecoder {
        pub fn new() -> Result<Self, CodecError> {
            let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            Ok(Self { decoder })
        }
    }

    impl Decoder for OpusDecoder {
        fn codec(&self) -> Codec {
            Codec::Opus
        }

        fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>, CodecError> {
            let mut output = vec![0i16; MAX_FRAME_SIZE];
            let len = self
                .decoder
                .decode(packet.payload(), &mut output, false)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            output.truncate(len);
            Ok(Some(DecodedFrame::Audio(AudioFrame {
                samples: output,
                sample_rate: OPUS_SAMPLE_RATE,
                channels: 1,
            })))
        }
    }

    /// Buffers PCM until a full 20 ms frame is available
    pub struct OpusEncoder {
        encoder: opus::Encoder,
        pending: Vec<i16>,
    }

    impl OpusEncoder {
        pub fn new() -> Result<Self, CodecError> {
            let encoder = opus::Encoder::new(
                OPUS_SAMPLE_RATE,
                opus::Channels::Mono,
                opus::Application::Voip,
            )
            .map_err(|e| CodecError::Encode(e.to_string()))?;
            Ok(Self {
                encoder,
                pending: Vec::with_capacity(OPUS_FRAME_SIZE * 2),
            })
        }
    }

    impl Encoder for OpusEncoder {
        fn codec(&self) -> Codec {
            Codec::Opus
        }

        fn encode(&mut self, frame: &DecodedFrame) -> Result<Vec<EncodedPayload>, CodecError> {
            let DecodedFrame::Audio(audio) = frame else {
                return Err(CodecError::Encode("Opus encoder fed a video frame".into()));
            };
            let mono = downmix(&audio.samples, audio.channels);
            self.pending
                .extend(resample(&mono, audio.sample_rate, OPUS_SAMPLE_RATE));

            let mut payloads = Vec::new();
            while self.pending.len() >= OPUS_FRAME_SIZE {
                let chunk: Vec<i16> = self.pending.drain(..OPUS_FRAME_SIZE).collect();
                let mut output = vec![0u8; 4000];
                let len = self
                    .encoder
                    .encode(&chunk, &mut output)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                output.truncate(len);
                payloads.push(EncodedPayload {
                    payload: output.into(),
                    marker: false,
                });
            }
            Ok(payloads)
        }
    }
}
