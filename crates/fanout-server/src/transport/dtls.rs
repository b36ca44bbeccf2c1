//! DTLS handshake over the session's multiplexed socket
//!
//! The session demuxer feeds DTLS records into a [`DtlsTransport`]; an
//! engine runs the handshake over it and exports SRTP keying material.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fanout_protocol::{DtlsFingerprint, DtlsRole};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use webrtc::dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc::dtls::conn::DTLSConn;
use webrtc::dtls::crypto::Certificate;
use webrtc::dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use webrtc::util::{Conn, KeyingMaterialExporter};

use super::srtp::KEYING_MATERIAL_LEN;
use crate::error::SecurityError;
use crate::pool::{JobPriority, WorkerPool};

pub const SRTP_EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Established DTLS state kept alive for the rest of the session
#[async_trait]
pub trait DtlsAssociation: Send + Sync {
    async fn close(&self);
}

pub struct HandshakeOutcome {
    pub keying_material: Vec<u8>,
    pub association: Option<Arc<dyn DtlsAssociation>>,
}

/// Performs DTLS handshakes for every live connection of a relay
#[async_trait]
pub trait DtlsEngine: Send + Sync {
    /// Fingerprint of the local certificate, advertised to peers
    fn fingerprint(&self) -> DtlsFingerprint;

    /// Run one handshake. The peer certificate must match `remote`.
    async fn handshake(
        &self,
        transport: DtlsTransport,
        role: DtlsRole,
        remote: DtlsFingerprint,
    ) -> Result<HandshakeOutcome, SecurityError>;
}

/// Datagram path for one handshake: records demuxed from the session socket
/// come in, records go out to the selected remote address.
pub struct DtlsTransport {
    incoming: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    remote: watch::Receiver<Option<SocketAddr>>,
}

impl DtlsTransport {
    pub fn new(
        incoming: mpsc::Receiver<Bytes>,
        socket: Arc<UdpSocket>,
        remote: watch::Receiver<Option<SocketAddr>>,
    ) -> Self {
        Self {
            incoming,
            socket,
            remote,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.borrow()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, record: &[u8]) -> std::io::Result<usize> {
        let remote = self.remote_addr().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no selected candidate pair")
        })?;
        self.socket.send_to(record, remote).await
    }

    /// Next record, or `None` once the session stopped feeding this transport
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }
}

/// [`DtlsTransport`] adapted to the connection trait the DTLS stack drives
struct ChannelConn {
    transport: Mutex<DtlsTransport>,
    socket: Arc<UdpSocket>,
    remote: watch::Receiver<Option<SocketAddr>>,
}

impl ChannelConn {
    fn new(transport: DtlsTransport) -> Self {
        Self {
            socket: transport.socket.clone(),
            remote: transport.remote.clone(),
            transport: Mutex::new(transport),
        }
    }

    fn remote(&self) -> webrtc::util::Result<SocketAddr> {
        (*self.remote.borrow()).ok_or_else(|| webrtc::util::Error::Other("no selected candidate pair".into()))
    }
}

#[async_trait]
impl Conn for ChannelConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc::util::Result<()> {
        Err(webrtc::util::Error::Other("connect is not supported".into()))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc::util::Result<usize> {
        let record = self
            .transport
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| webrtc::util::Error::Other("dtls transport closed".into()))?;
        let n = record.len().min(buf.len());
        buf[..n].copy_from_slice(&record[..n]);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc::util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.remote()?))
    }

    async fn send(&self, buf: &[u8]) -> webrtc::util::Result<usize> {
        let remote = self.remote()?;
        self.socket
            .send_to(buf, remote)
            .await
            .map_err(|e| webrtc::util::Error::Other(e.to_string()))
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc::util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc::util::Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| webrtc::util::Error::Other(e.to_string()))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.borrow()
    }

    async fn close(&self) -> webrtc::util::Result<()> {
        // The socket belongs to the session
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

struct WebRtcAssociation {
    conn: DTLSConn,
}

#[async_trait]
impl DtlsAssociation for WebRtcAssociation {
    async fn close(&self) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "error closing DTLS association");
        }
    }
}

/// DTLS 1.2 with `use_srtp`, backed by `webrtc::dtls`
pub struct WebRtcDtlsEngine {
    certificate: Certificate,
    fingerprint: DtlsFingerprint,
}

impl WebRtcDtlsEngine {
    /// Generate the relay's self-signed certificate on the CPU pool
    pub async fn generate(cpu: &WorkerPool) -> Result<Self, SecurityError> {
        let certificate = cpu
            .run(JobPriority::Control, || {
                Certificate::generate_self_signed(vec!["fanout".to_owned()])
            })
            .await
            .map_err(|e| SecurityError::Certificate(e.to_string()))?
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;
        Self::from_certificate(certificate)
    }

    pub fn from_certificate(certificate: Certificate) -> Result<Self, SecurityError> {
        let der = certificate
            .certificate
            .first()
            .ok_or_else(|| SecurityError::Certificate("certificate chain is empty".into()))?;
        let der: &[u8] = der.as_ref();
        let fingerprint = DtlsFingerprint::sha256(&Sha256::digest(der));
        tracing::info!(fingerprint = %fingerprint, "DTLS certificate ready");
        Ok(Self {
            certificate,
            fingerprint,
        })
    }
}

#[async_trait]
impl DtlsEngine for WebRtcDtlsEngine {
    fn fingerprint(&self) -> DtlsFingerprint {
        self.fingerprint.clone()
    }

    async fn handshake(
        &self,
        transport: DtlsTransport,
        role: DtlsRole,
        remote: DtlsFingerprint,
    ) -> Result<HandshakeOutcome, SecurityError> {
        let config = Config {
            certificates: vec![self.certificate.clone()],
            srtp_protection_profiles: vec![SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80],
            client_auth: ClientAuthType::RequireAnyClientCert,
            extended_master_secret: ExtendedMasterSecretType::Require,
            // Trust comes from the signalled fingerprint, checked below
            insecure_skip_verify: true,
            ..Default::default()
        };
        let conn: Arc<dyn Conn + Send + Sync> = Arc::new(ChannelConn::new(transport));
        let is_client = role == DtlsRole::Client;
        let dtls = DTLSConn::new(conn, config, is_client, None)
            .await
            .map_err(|e| SecurityError::Handshake(e.to_string()))?;

        let state = dtls.connection_state().await;
        let peer = state
            .peer_certificates
            .first()
            .ok_or_else(|| SecurityError::Handshake("peer sent no certificate".into()))?;
        let actual = DtlsFingerprint::sha256(&Sha256::digest(peer));
        if !actual.matches(&remote) {
            tracing::warn!(
                target: "fanout::security",
                expected = %remote,
                actual = %actual,
                "DTLS peer certificate does not match signalled fingerprint"
            );
            let _ = dtls.close().await;
            return Err(SecurityError::FingerprintMismatch);
        }

        let keying_material = state
            .export_keying_material(SRTP_EXPORTER_LABEL, &[], KEYING_MATERIAL_LEN)
            .await
            .map_err(|e| SecurityError::Srtp(e.to_string()))?;

        Ok(HandshakeOutcome {
            keying_material,
            association: Some(Arc::new(WebRtcAssociation { conn: dtls })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[tokio::test]
    async fn generated_certificate_has_sha256_fingerprint() {
        let cpu = WorkerPool::new(
            "test-cpu",
            &PoolConfig {
                workers: 1,
                ..PoolConfig::default()
            },
        );
        let engine = WebRtcDtlsEngine::generate(&cpu).await.unwrap();
        let fingerprint = engine.fingerprint();
        assert_eq!(fingerprint.algorithm, "sha-256");
        // 32 bytes as colon-separated hex
        assert_eq!(fingerprint.value.len(), 32 * 3 - 1);
    }

    #[tokio::test]
    async fn transport_sends_to_selected_remote() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (selected_tx, selected_rx) = watch::channel(None);
        let (incoming_tx, incoming_rx) = mpsc::channel(4);
        let mut transport = DtlsTransport::new(incoming_rx, a.clone(), selected_rx);

        assert!(transport.send(&[22, 1]).await.is_err());
        selected_tx.send_replace(Some(b.local_addr().unwrap()));
        transport.send(&[22, 2]).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[22, 2]);
        assert_eq!(from, a.local_addr().unwrap());

        incoming_tx.send(Bytes::from_static(&[22, 3])).await.unwrap();
        drop(incoming_tx);
        assert_eq!(transport.recv().await, Some(Bytes::from_static(&[22, 3])));
        assert_eq!(transport.recv().await, None);
    }
}
