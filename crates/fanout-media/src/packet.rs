//! Media packet as it travels between transports, pipelines and routers.

use std::time::Instant;

use bytes::{Buf, Bytes};
use fanout_protocol::MediaKind;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

use crate::error::PacketError;

/// An RTP media packet with its metadata.
///
/// Packets are immutable once built; rewriting any header field produces a new
/// packet sharing the same payload buffer.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    kind: MediaKind,
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
    payload_type: u8,
    marker: bool,
    payload: Bytes,
    arrival: Instant,
}

impl MediaPacket {
    pub fn builder(kind: MediaKind) -> MediaPacketBuilder {
        MediaPacketBuilder {
            packet: MediaPacket {
                kind,
                ssrc: 0,
                sequence_number: 0,
                timestamp: 0,
                payload_type: 0,
                marker: false,
                payload: Bytes::new(),
                arrival: Instant::now(),
            },
        }
    }

    /// Wrap a parsed RTP packet. Header extensions and CSRCs are not carried.
    pub fn from_rtp(packet: Packet, kind: MediaKind, arrival: Instant) -> Self {
        Self {
            kind,
            ssrc: packet.header.ssrc,
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            payload_type: packet.header.payload_type,
            marker: packet.header.marker,
            payload: packet.payload,
            arrival,
        }
    }

    /// Parse a plaintext RTP datagram
    pub fn parse(raw: &[u8], kind: MediaKind, arrival: Instant) -> Result<Self, PacketError> {
        let mut buf = raw;
        let packet = Packet::unmarshal(&mut buf).map_err(|e| PacketError::Malformed(e.to_string()))?;
        Ok(Self::from_rtp(packet, kind, arrival))
    }

    /// Peek at the payload type of a plaintext RTP datagram without parsing it
    pub fn peek_payload_type(raw: &[u8]) -> Option<u8> {
        let mut buf = raw;
        if buf.remaining() < 12 {
            return None;
        }
        buf.advance(1);
        Some(buf.get_u8() & 0x7f)
    }

    pub fn to_rtp(&self) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker: self.marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: self.payload.clone(),
        }
    }

    pub fn marshal(&self) -> Result<Bytes, PacketError> {
        self.to_rtp()
            .marshal()
            .map_err(|e| PacketError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// Copy of this packet with a different payload type
    pub fn with_payload_type(&self, payload_type: u8) -> Self {
        Self {
            payload_type,
            ..self.clone()
        }
    }

    /// Copy of this packet placed into another RTP stream
    pub fn rewritten(&self, ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence_number,
            timestamp,
            ..self.clone()
        }
    }
}

pub struct MediaPacketBuilder {
    packet: MediaPacket,
}

impl MediaPacketBuilder {
    pub fn ssrc(mut self, ssrc: u32) -> Self {
        self.packet.ssrc = ssrc;
        self
    }

    pub fn sequence_number(mut self, sequence_number: u16) -> Self {
        self.packet.sequence_number = sequence_number;
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.packet.timestamp = timestamp;
        self
    }

    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.packet.payload_type = payload_type;
        self
    }

    pub fn marker(mut self, marker: bool) -> Self {
        self.packet.marker = marker;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.packet.payload = payload.into();
        self
    }

    pub fn arrival(mut self, arrival: Instant) -> Self {
        self.packet.arrival = arrival;
        self
    }

    pub fn build(self) -> MediaPacket {
        self.packet
    }
}
