//! Media handling for the fanout relay
//!
//! This crate provides:
//! - `MediaPacket`, the immutable unit moved between transports and routers
//! - the codec abstraction and the built-in audio codecs (G.711, optional Opus)
//! - packet transformers (jitter buffer, stream rewriter)

pub mod audio;
pub mod codec;
pub mod error;
pub mod jitter;
pub mod packet;
pub mod transform;

pub use codec::{
    AudioFrame, CodecFactory, CodecRegistry, DecodedFrame, Decoder, EncodedPayload, Encoder,
    VideoFrame,
};
pub use error::{CodecError, PacketError};
pub use jitter::{JitterBuffer, JitterConfig, JitterStats, SequenceUnwrapper};
pub use packet::{MediaPacket, MediaPacketBuilder};
pub use transform::{PacketTransform, StreamRewriter, TransformChain};
