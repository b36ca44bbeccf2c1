//! Codec abstraction
//!
//! The relay never implements video codecs itself. Decoders and encoders are
//! produced by a [`CodecFactory`]; the [`CodecRegistry`] combines the built-in
//! audio codecs with any factories the host registers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use fanout_protocol::{Codec, CodecParameters};

use crate::audio::{G711Decoder, G711Encoder, G711Law};
use crate::error::CodecError;
use crate::packet::MediaPacket;

/// Raw PCM audio, interleaved
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn duration_samples(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// A decoded picture. The pixel layout is private to the codec factory that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub keyframe: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

/// One RTP payload produced by an encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    pub payload: Bytes,
    pub marker: bool,
}

pub trait Decoder: Send {
    fn codec(&self) -> Codec;

    /// Feed one packet. Returns a frame once one is complete; packetized
    /// video may need several packets per frame.
    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>, CodecError>;
}

pub trait Encoder: Send {
    fn codec(&self) -> Codec;

    /// Encode one frame into zero or more RTP payloads
    fn encode(&mut self, frame: &DecodedFrame) -> Result<Vec<EncodedPayload>, CodecError>;

    /// Make the next encoded frame independently decodable
    fn force_keyframe(&mut self) {}
}

pub trait CodecFactory: Send + Sync {
    fn decoder(&self, params: &CodecParameters) -> Result<Box<dyn Decoder>, CodecError>;
    fn encoder(&self, params: &CodecParameters) -> Result<Box<dyn Encoder>, CodecError>;
}

/// Built-in audio codecs plus host-registered factories.
///
/// Registered factories are consulted first, in registration order, so a host
/// can override the built-ins.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    external: Vec<Arc<dyn CodecFactory>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn register(&mut self, factory: Arc<dyn CodecFactory>) {
        self.external.push(factory);
    }

    fn builtin_decoder(params: &CodecParameters) -> Result<Box<dyn Decoder>, CodecError> {
        match params.codec {
            Codec::Pcmu => Ok(Box::new(G711Decoder::new(G711Law::MuLaw))),
            Codec::Pcma => Ok(Box::new(G711Decoder::new(G711Law::ALaw))),
            #[cfg(feature = "opus")]
            Codec::Opus => Ok(Box::new(crate::audio::OpusDecoder::new()?)),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    fn builtin_encoder(params: &CodecParameters) -> Result<Box<dyn Encoder>, CodecError> {
        match params.codec {
            Codec::Pcmu => Ok(Box::new(G711Encoder::new(G711Law::MuLaw))),
            Codec::Pcma => Ok(Box::new(G711Encoder::new(G711Law::ALaw))),
            #[cfg(feature = "opus")]
            Codec::Opus => Ok(Box::new(crate::audio::OpusEncoder::new()?)),
            other => Err(CodecError::Unsupported(other)),
        }
    }
}

impl CodecFactory for CodecRegistry {
    fn decoder(&self, params: &CodecParameters) -> Result<Box<dyn Decoder>, CodecError> {
        for factory in &self.external {
            match factory.decoder(params) {
                Err(CodecError::Unsupported(_)) => continue,
                result => return result,
            }
        }
        Self::builtin_decoder(params)
    }

    fn encoder(&self, params: &CodecParameters) -> Result<Box<dyn Encoder>, CodecError> {
        for factory in &self.external {
            match factory.encoder(params) {
                Err(CodecError::Unsupported(_)) => continue,
                result => return result,
            }
        }
        Self::builtin_encoder(params)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("external_factories", &self.external.len())
            .finish()
    }
}
