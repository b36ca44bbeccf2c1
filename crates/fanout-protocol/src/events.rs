use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, ConnectionState, IceCandidate, RouterId};

/// Why a connection entered the `Failed` state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// No pair became connected, or connectivity was lost past the grace period
    IceFailed,
    /// DTLS handshake did not complete in time
    DtlsTimeout,
    /// Peer certificate did not match the signalled fingerprint
    FingerprintMismatch,
    /// Any other DTLS or SRTP setup failure
    HandshakeFailed { detail: String },
    /// The socket became unusable
    SocketError { detail: String },
}

/// Events delivered to the host application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    StateChanged {
        connection_id: ConnectionId,
        state: ConnectionState,
        at: DateTime<Utc>,
    },

    CandidatesGathered {
        connection_id: ConnectionId,
        candidates: Vec<IceCandidate>,
    },

    Failed {
        connection_id: ConnectionId,
        reason: FailureReason,
    },

    /// ICE connectivity was lost and checks restarted
    ConnectivityLost { connection_id: ConnectionId },

    /// ICE connectivity came back within the grace period
    ConnectivityRestored { connection_id: ConnectionId },

    PublisherLost {
        router_id: RouterId,
        connection_id: ConnectionId,
    },
}

impl ConnectionEvent {
    pub fn state_changed(connection_id: ConnectionId, state: ConnectionState) -> Self {
        ConnectionEvent::StateChanged {
            connection_id,
            state,
            at: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::StateChanged { connection_id, .. }
            | ConnectionEvent::CandidatesGathered { connection_id, .. }
            | ConnectionEvent::Failed { connection_id, .. }
            | ConnectionEvent::ConnectivityLost { connection_id }
            | ConnectionEvent::ConnectivityRestored { connection_id }
            | ConnectionEvent::PublisherLost { connection_id, .. } => *connection_id,
        }
    }
}

/// Transport counters for one live connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub rtcp_received: u64,
    pub rtcp_sent: u64,
    pub stun_requests: u64,
    pub srtp_auth_failures: u64,
    pub dropped_not_ready: u64,
    pub dropped_unknown_source: u64,
    pub dropped_queue_full: u64,
    pub malformed: u64,
}

/// Media pipeline counters for one connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub inbound_packets: u64,
    pub unknown_payload_type: u64,
    pub reordered: u64,
    pub late_dropped: u64,
    pub lost: u64,
    pub outbound_packets: u64,
    pub outbound_dropped: u64,
}

/// Per-router fan-out counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterStats {
    pub subscribers: usize,
    pub has_publisher: bool,
    pub packets_in: u64,
    pub relayed: u64,
    pub transcoded: u64,
    pub decodes: u64,
    pub encodes: u64,
    pub codec_errors: u64,
    pub unknown_payload_type: u64,
    pub dropped_no_route: u64,
}

/// Worker pool counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub executed: u64,
    pub skipped_closed: u64,
    pub dropped_oldest: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub queued: usize,
}

/// Snapshot returned to the host for one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub transport: Option<TransportStats>,
    pub pipeline: PipelineStats,
}
