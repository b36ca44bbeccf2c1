//! WebRTC transport: ICE connectivity, DTLS handshake and SRTP protection
//! multiplexed on one UDP socket per connection.

mod demux;
pub mod dtls;
mod ice;
mod session;
mod srtp;
mod state;
mod stats;
mod stun;

use bytes::Bytes;

pub use demux::{DatagramKind, classify};
pub use dtls::{DtlsAssociation, DtlsEngine, DtlsTransport, HandshakeOutcome, WebRtcDtlsEngine};
pub use ice::{IceAgent, IceEvent, Transmit};
pub use session::{SessionContext, TransportSession};
pub use srtp::KEYING_MATERIAL_LEN;
pub use state::StateMachine;
pub use stats::TransportCounters;

/// Receives authenticated, decrypted packets from a session.
///
/// Called on the I/O runtime; implementations hand the packet off and return.
pub trait PacketListener: Send + Sync {
    fn on_rtp(&self, packet: Bytes);
    fn on_rtcp(&self, packet: Bytes);
}
