use fanout_protocol::{CandidateParseError, ConnectionId, FailureReason, RouterId};
use thiserror::Error;

pub use fanout_media::CodecError;

/// ICE and socket failures. A new connection can be attempted after these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no usable network interface for ICE gathering: {0}")]
    IceGathering(String),

    #[error("ICE connectivity failed: {0}")]
    IceFailed(String),

    #[error("invalid remote candidate: {0}")]
    InvalidCandidate(#[from] CandidateParseError),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("operation not valid in state {0}")]
    InvalidState(fanout_protocol::ConnectionState),

    #[error("transport session has shut down")]
    SessionGone,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Socket(err.to_string())
    }
}

/// DTLS and SRTP failures. Fatal for the connection; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("remote certificate fingerprint does not match the signalled one")]
    FingerprintMismatch,

    #[error("DTLS handshake did not complete within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("DTLS handshake failed: {0}")]
    Handshake(String),

    #[error("SRTP setup failed: {0}")]
    Srtp(String),

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("remote parameters missing")]
    MissingRemoteParameters,
}

impl SecurityError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SecurityError::FingerprintMismatch => FailureReason::FingerprintMismatch,
            SecurityError::HandshakeTimeout(_) => FailureReason::DtlsTimeout,
            other => FailureReason::HandshakeFailed {
                detail: other.to_string(),
            },
        }
    }
}

/// Resource exhaustion in the worker pools
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("job queue full")]
    QueueFull,

    #[error("job dropped to make room for newer work")]
    Evicted,

    #[error("owner closed before the job ran")]
    OwnerClosed,

    #[error("job panicked")]
    Panicked,

    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Errors returned by the relay facade
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("router not found: {0}")]
    RouterNotFound(RouterId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("endpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
