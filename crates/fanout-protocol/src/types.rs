use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a connection (live transport or external endpoint)
pub type ConnectionId = Uuid;

/// Identifier of a one-to-many router
pub type RouterId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Codecs the relay knows how to route
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Pcmu,
    Pcma,
    Vp8,
    Vp9,
    H264,
}

impl Codec {
    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::Opus | Codec::Pcmu | Codec::Pcma => MediaKind::Audio,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 => MediaKind::Video,
        }
    }

    /// RTP clock rate
    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48_000,
            Codec::Pcmu | Codec::Pcma => 8_000,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 => 90_000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            Codec::Opus => 2,
            Codec::Pcmu | Codec::Pcma => 1,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 => 0,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Opus => "audio/opus",
            Codec::Pcmu => "audio/PCMU",
            Codec::Pcma => "audio/PCMA",
            Codec::Vp8 => "video/VP8",
            Codec::Vp9 => "video/VP9",
            Codec::H264 => "video/H264",
        }
    }

    /// Static payload type assignment, or the conventional dynamic one
    pub fn default_payload_type(&self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
            Codec::Opus => 111,
            Codec::Vp8 => 96,
            Codec::Vp9 => 98,
            Codec::H264 => 102,
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Codec> {
        let codec = match mime.to_ascii_lowercase().as_str() {
            "audio/opus" => Codec::Opus,
            "audio/pcmu" => Codec::Pcmu,
            "audio/pcma" => Codec::Pcma,
            "video/vp8" => Codec::Vp8,
            "video/vp9" => Codec::Vp9,
            "video/h264" => Codec::H264,
            _ => return None,
        };
        Some(codec)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// A codec as negotiated on one connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CodecParameters {
    pub codec: Codec,
    pub payload_type: u8,
    #[serde(default)]
    pub fmtp: Option<String>,
}

impl CodecParameters {
    pub fn new(codec: Codec, payload_type: u8) -> Self {
        Self {
            codec,
            payload_type,
            fmtp: None,
        }
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    pub fn clock_rate(&self) -> u32 {
        self.codec.clock_rate()
    }

    /// Whether packets in `self` can be relayed to a peer that negotiated `other`
    /// without transcoding. Payload type numbers may differ; H.264 additionally
    /// requires the same packetization mode.
    pub fn is_compatible_with(&self, other: &CodecParameters) -> bool {
        if self.codec != other.codec {
            return false;
        }
        if self.codec == Codec::H264 {
            return self.fmtp_value("packetization-mode") == other.fmtp_value("packetization-mode");
        }
        true
    }

    fn fmtp_value(&self, key: &str) -> Option<&str> {
        self.fmtp.as_deref().and_then(|fmtp| {
            fmtp.split(';').find_map(|pair| {
                let (k, v) = pair.trim().split_once('=')?;
                (k == key).then_some(v)
            })
        })
    }
}

/// Connection state as observed by the host application
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    New,
    IceGathering,
    IceConnecting,
    IceConnected,
    DtlsHandshaking,
    Ready,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which remote candidates are still useful
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            ConnectionState::New
                | ConnectionState::IceGathering
                | ConnectionState::IceConnecting
                | ConnectionState::IceConnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::IceGathering => "ice_gathering",
            ConnectionState::IceConnecting => "ice_connecting",
            ConnectionState::IceConnected => "ice_connected",
            ConnectionState::DtlsHandshaking => "dtls_handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    /// RFC 8445 type preference
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::Prflx => 110,
            CandidateType::Srflx => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(String),
}

/// ICE candidate in SDP `candidate-attribute` form (UDP only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub typ: CandidateType,
    #[serde(default)]
    pub related_address: Option<SocketAddr>,
}

impl IceCandidate {
    pub fn host(address: SocketAddr, local_preference: u16) -> Self {
        let typ = CandidateType::Host;
        Self {
            foundation: Self::compute_foundation(typ, address.ip()),
            component: 1,
            priority: Self::compute_priority(typ, local_preference, 1),
            address: address.ip(),
            port: address.port(),
            typ,
            related_address: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// RFC 8445 section 5.1.2.1
    pub fn compute_priority(typ: CandidateType, local_preference: u16, component: u16) -> u32 {
        (typ.preference() << 24) + ((local_preference as u32) << 8) + (256 - component as u32)
    }

    fn compute_foundation(typ: CandidateType, ip: IpAddr) -> String {
        // Stable per (type, base address); FNV-1a keeps it short and deterministic.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in format!("{typ}{ip}udp").bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash.to_string()
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation, self.component, self.priority, self.address, self.port, self.typ
        )?;
        if let Some(related) = self.related_address {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

impl FromStr for IceCandidate {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let mut fields = s.split_whitespace();

        let mut next = |name: &'static str| fields.next().ok_or(CandidateParseError::MissingField(name));

        let foundation = next("foundation")?.to_string();
        let component = parse_field(next("component")?, "component")?;
        let transport = next("transport")?;
        if !transport.eq_ignore_ascii_case("udp") {
            return Err(CandidateParseError::UnsupportedTransport(transport.to_string()));
        }
        let priority = parse_field(next("priority")?, "priority")?;
        let address = parse_field(next("address")?, "address")?;
        let port = parse_field(next("port")?, "port")?;
        if next("typ")? != "typ" {
            return Err(CandidateParseError::MissingField("typ"));
        }
        let typ = match next("type")? {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::Srflx,
            "prflx" => CandidateType::Prflx,
            "relay" => CandidateType::Relay,
            other => {
                return Err(CandidateParseError::InvalidField {
                    field: "type",
                    value: other.to_string(),
                });
            }
        };

        // Trailing extension attributes come in name/value pairs
        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        while let Some(name) = fields.next() {
            let Some(value) = fields.next() else { break };
            match name {
                "raddr" => raddr = Some(parse_field(value, "raddr")?),
                "rport" => rport = Some(parse_field(value, "rport")?),
                _ => {}
            }
        }

        Ok(IceCandidate {
            foundation,
            component,
            priority,
            address,
            port,
            typ,
            related_address: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
        })
    }
}

fn parse_field<T: FromStr>(value: &str, field: &'static str) -> Result<T, CandidateParseError> {
    value.parse().map_err(|_| CandidateParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// DTLS certificate fingerprint as carried in SDP (`a=fingerprint:sha-256 AB:CD:...`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    pub fn sha256(digest: &[u8]) -> Self {
        Self {
            algorithm: "sha-256".to_string(),
            value: digest
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }

    /// Case-insensitive comparison of algorithm and hex value
    pub fn matches(&self, other: &DtlsFingerprint) -> bool {
        self.algorithm.eq_ignore_ascii_case(&other.algorithm)
            && self.value.eq_ignore_ascii_case(&other.value)
    }
}

impl fmt::Display for DtlsFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.value)
    }
}

impl FromStr for DtlsFingerprint {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=fingerprint:").unwrap_or(s);
        let (algorithm, value) = s
            .split_once(' ')
            .ok_or(CandidateParseError::MissingField("fingerprint value"))?;
        Ok(Self {
            algorithm: algorithm.trim().to_ascii_lowercase(),
            value: value.trim().to_ascii_uppercase(),
        })
    }
}

/// SDP `a=setup` role announced by the remote side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DtlsSetup {
    Active,
    Passive,
    #[default]
    ActPass,
}

/// Role this side plays in the DTLS handshake
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Client,
    Server,
}

impl DtlsSetup {
    /// Local role given the remote's setup attribute
    pub fn local_role(&self) -> DtlsRole {
        match self {
            DtlsSetup::Active => DtlsRole::Server,
            DtlsSetup::Passive | DtlsSetup::ActPass => DtlsRole::Client,
        }
    }
}

/// Parameters learned from the remote description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteParameters {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: DtlsFingerprint,
    #[serde(default)]
    pub setup: DtlsSetup,
}

/// Parameters the host puts into the local description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalParameters {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: DtlsFingerprint,
    pub candidates: Vec<IceCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_candidate_with_prefix() {
        let c: IceCandidate = "a=candidate:842163049 1 udp 2122260223 192.168.1.10 54400 typ host generation 0"
            .parse()
            .unwrap();
        assert_eq!(c.foundation, "842163049");
        assert_eq!(c.component, 1);
        assert_eq!(c.priority, 2122260223);
        assert_eq!(c.socket_addr(), "192.168.1.10:54400".parse().unwrap());
        assert_eq!(c.typ, CandidateType::Host);
        assert!(c.related_address.is_none());
    }

    #[test]
    fn parses_srflx_related_address() {
        let c: IceCandidate =
            "candidate:1 1 UDP 1686052607 203.0.113.5 61000 typ srflx raddr 10.0.0.2 rport 50000"
                .parse()
                .unwrap();
        assert_eq!(c.typ, CandidateType::Srflx);
        assert_eq!(c.related_address, Some("10.0.0.2:50000".parse().unwrap()));
    }

    #[test]
    fn rejects_tcp_candidates() {
        let err = "candidate:1 1 tcp 1518280447 10.0.0.2 9 typ host tcptype active"
            .parse::<IceCandidate>()
            .unwrap_err();
        assert_eq!(err, CandidateParseError::UnsupportedTransport("tcp".into()));
    }

    #[test]
    fn candidate_display_round_trips() {
        let c = IceCandidate::host("127.0.0.1:5000".parse().unwrap(), 65535);
        let parsed: IceCandidate = c.to_string().parse().unwrap();
        assert_eq!(parsed, c);
        assert_eq!(c.priority >> 24, 126);
    }

    #[test]
    fn fingerprint_comparison_ignores_case() {
        let a: DtlsFingerprint = "sha-256 ab:cd:ef".parse().unwrap();
        let b = DtlsFingerprint {
            algorithm: "SHA-256".into(),
            value: "AB:CD:EF".into(),
        };
        assert!(a.matches(&b));
        assert_eq!(DtlsFingerprint::sha256(&[0xab, 0x01]).value, "AB:01");
    }

    #[test]
    fn h264_compatibility_checks_packetization_mode() {
        let a = CodecParameters::new(Codec::H264, 102).with_fmtp("profile-level-id=42e01f;packetization-mode=1");
        let b = CodecParameters::new(Codec::H264, 125).with_fmtp("packetization-mode=1;profile-level-id=42e01f");
        let c = CodecParameters::new(Codec::H264, 127).with_fmtp("packetization-mode=0");
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
        assert!(!a.is_compatible_with(&CodecParameters::new(Codec::Vp8, 96)));
    }

    #[test]
    fn setup_determines_local_role() {
        assert_eq!(DtlsSetup::Active.local_role(), DtlsRole::Server);
        assert_eq!(DtlsSetup::ActPass.local_role(), DtlsRole::Client);
    }
}
