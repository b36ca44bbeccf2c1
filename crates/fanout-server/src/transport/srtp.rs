//! SRTP/SRTCP protection keyed from the DTLS handshake (RFC 5764)

use bytes::Bytes;
use fanout_protocol::{ConnectionId, DtlsRole};
use webrtc::srtp::context::Context;
use webrtc::srtp::option::{srtcp_replay_protection, srtp_replay_protection};
use webrtc::srtp::protection_profile::ProtectionProfile;

use super::PacketListener;
use super::stats::TransportCounters;
use crate::error::SecurityError;

pub const SRTP_MASTER_KEY_LEN: usize = 16;
pub const SRTP_MASTER_SALT_LEN: usize = 14;

/// Bytes of `EXTRACTOR-dtls_srtp` material needed for AES128_CM_HMAC_SHA1_80
pub const KEYING_MATERIAL_LEN: usize = 2 * (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN);

const REPLAY_WINDOW: usize = 64;

/// Master keys for both directions, already assigned to local/remote
pub struct SrtpKeys {
    local_key: Vec<u8>,
    local_salt: Vec<u8>,
    remote_key: Vec<u8>,
    remote_salt: Vec<u8>,
}

impl SrtpKeys {
    /// Split exported keying material. The layout is
    /// `client_key | server_key | client_salt | server_salt`; the DTLS client
    /// writes with the client half.
    pub fn split(material: &[u8], role: DtlsRole) -> Result<Self, SecurityError> {
        if material.len() < KEYING_MATERIAL_LEN {
            return Err(SecurityError::Srtp(format!(
                "keying material too short: {} bytes",
                material.len()
            )));
        }
        let (client_key, rest) = material.split_at(SRTP_MASTER_KEY_LEN);
        let (server_key, rest) = rest.split_at(SRTP_MASTER_KEY_LEN);
        let (client_salt, rest) = rest.split_at(SRTP_MASTER_SALT_LEN);
        let server_salt = &rest[..SRTP_MASTER_SALT_LEN];

        let (local_key, local_salt, remote_key, remote_salt) = match role {
            DtlsRole::Client => (client_key, client_salt, server_key, server_salt),
            DtlsRole::Server => (server_key, server_salt, client_key, client_salt),
        };
        Ok(Self {
            local_key: local_key.to_vec(),
            local_salt: local_salt.to_vec(),
            remote_key: remote_key.to_vec(),
            remote_salt: remote_salt.to_vec(),
        })
    }
}

/// Derive both SRTP contexts. Key derivation runs AES; callers put it on the
/// CPU pool.
pub fn derive(material: &[u8], role: DtlsRole) -> Result<(InboundSrtp, OutboundSrtp), SecurityError> {
    let keys = SrtpKeys::split(material, role)?;
    let inbound = Context::new(
        &keys.remote_key,
        &keys.remote_salt,
        ProtectionProfile::Aes128CmHmacSha1_80,
        Some(srtp_replay_protection(REPLAY_WINDOW)),
        Some(srtcp_replay_protection(REPLAY_WINDOW)),
    )
    .map_err(|e| SecurityError::Srtp(e.to_string()))?;
    let outbound = Context::new(
        &keys.local_key,
        &keys.local_salt,
        ProtectionProfile::Aes128CmHmacSha1_80,
        None,
        None,
    )
    .map_err(|e| SecurityError::Srtp(e.to_string()))?;
    Ok((InboundSrtp { context: inbound }, OutboundSrtp { context: outbound }))
}

/// Decrypting half, owned by the session's socket task
pub struct InboundSrtp {
    context: Context,
}

impl InboundSrtp {
    /// Authenticate and decrypt one datagram, handing plaintext to `listener`.
    ///
    /// Returns `false` when authentication or decryption failed. In that case
    /// the listener is not called and nothing derived from the datagram
    /// leaves this function.
    pub fn deliver(
        &mut self,
        connection_id: ConnectionId,
        datagram: &[u8],
        rtcp: bool,
        listener: &dyn PacketListener,
        counters: &TransportCounters,
    ) -> bool {
        let decrypted = if rtcp {
            self.context.decrypt_rtcp(datagram)
        } else {
            self.context.decrypt_rtp(datagram)
        };
        match decrypted {
            Ok(plaintext) => {
                if rtcp {
                    TransportCounters::bump(&counters.rtcp_received);
                    listener.on_rtcp(plaintext);
                } else {
                    TransportCounters::bump(&counters.packets_received);
                    listener.on_rtp(plaintext);
                }
                true
            }
            Err(e) => {
                let failures = TransportCounters::bump(&counters.srtp_auth_failures);
                if failures == 1 || failures % 100 == 0 {
                    tracing::warn!(
                        target: "fanout::security",
                        connection = %connection_id,
                        failures,
                        rtcp,
                        error = %e,
                        "dropping packet that failed SRTP authentication"
                    );
                }
                false
            }
        }
    }
}

/// Encrypting half, shared by the senders of a session
pub struct OutboundSrtp {
    context: Context,
}

impl OutboundSrtp {
    pub fn protect_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes, SecurityError> {
        self.context
            .encrypt_rtp(plaintext)
            .map_err(|e| SecurityError::Srtp(e.to_string()))
    }

    pub fn protect_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes, SecurityError> {
        self.context
            .encrypt_rtcp(plaintext)
            .map_err(|e| SecurityError::Srtp(e.to_string()))
    }
}
