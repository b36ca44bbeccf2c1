use fanout_protocol::Codec;
use thiserror::Error;

/// Codec failures. Per-packet variants drop the packet; `Unsupported` and
/// `Incompatible` disable the route that needed the codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("no codec implementation available for {0}")]
    Unsupported(Codec),

    #[error("cannot transcode {from} to {to}")]
    Incompatible { from: Codec, to: Codec },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

impl CodecError {
    /// Whether the error concerns a single packet rather than the codec itself
    pub fn is_per_packet(&self) -> bool {
        matches!(self, CodecError::Decode(_) | CodecError::Encode(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed RTP packet: {0}")]
    Malformed(String),
}
