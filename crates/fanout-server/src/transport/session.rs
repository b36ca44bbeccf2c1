use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use fanout_media::MediaPacket;
use fanout_protocol::{
    ConnectionEvent, ConnectionId, ConnectionState, FailureReason, IceCandidate, LocalParameters,
    RemoteParameters, TransportStats,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::PacketListener;
use super::demux::{DatagramKind, classify};
use super::dtls::{DtlsAssociation, DtlsEngine, DtlsTransport};
use super::ice::{IceAgent, IceEvent, StunOutcome};
use super::srtp::{self, InboundSrtp, OutboundSrtp};
use super::state::StateMachine;
use super::stats::TransportCounters;
use super::stun::Credentials;
use crate::config::{DtlsConfig, IceConfig};
use crate::error::{RelayError, SecurityError, TransportError};
use crate::pool::{JobOwner, JobPriority, Lifecycle, Pools};

const RECV_BUFFER_SIZE: usize = 2048;
const DTLS_CHANNEL_CAPACITY: usize = 64;
const MAX_EARLY_DTLS: usize = 32;

/// Everything a session borrows from its relay
#[derive(Clone)]
pub struct SessionContext {
    pub pools: Pools,
    pub dtls: Arc<dyn DtlsEngine>,
    pub dtls_config: DtlsConfig,
    pub events: broadcast::Sender<ConnectionEvent>,
}

enum Command {
    AddCandidate(IceCandidate),
    EndOfCandidates,
    SetRemote(RemoteParameters),
}

struct SendPath {
    srtp: OutboundSrtp,
    socket: Arc<UdpSocket>,
}

struct Established {
    inbound: InboundSrtp,
    outbound: OutboundSrtp,
    association: Option<Arc<dyn DtlsAssociation>>,
}

struct SessionShared {
    id: ConnectionId,
    context: SessionContext,
    listener: Arc<dyn PacketListener>,
    credentials: Credentials,
    state: Mutex<StateMachine>,
    counters: TransportCounters,
    lifecycle: Lifecycle,
    selected: watch::Sender<Option<SocketAddr>>,
    send_path: Mutex<Option<SendPath>>,
    commands: mpsc::UnboundedSender<Command>,
    /// Handed to the actor by `open`
    pending: Mutex<Option<(mpsc::UnboundedReceiver<Command>, oneshot::Receiver<()>)>>,
    released: Arc<AtomicBool>,
}

impl JobOwner for SessionShared {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl SessionShared {
    fn state(&self) -> ConnectionState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).state()
    }

    fn send_path(&self) -> MutexGuard<'_, Option<SendPath>> {
        self.send_path.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.context.events.send(event);
    }

    /// Apply a state change and announce it. `false` if the change is not
    /// legal from the current state.
    fn transition(&self, to: ConnectionState) -> bool {
        let from = {
            let mut machine = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match machine.transition(to) {
                Ok(from) => from,
                Err(_) => return false,
            }
        };
        tracing::info!(connection = %self.id, %from, %to, "connection state changed");
        self.emit(ConnectionEvent::state_changed(self.id, to));
        true
    }

    fn fail(&self, reason: FailureReason) {
        if self.transition(ConnectionState::Failed) {
            tracing::error!(connection = %self.id, reason = ?reason, "connection failed");
            self.emit(ConnectionEvent::Failed {
                connection_id: self.id,
                reason,
            });
        }
        self.lifecycle.close();
    }
}

/// One WebRTC transport: ICE connectivity, DTLS handshake and SRTP on a
/// single UDP socket.
///
/// The state machine is driven by an actor task on the I/O pool. Methods on
/// this handle only post commands or read shared state, so none of them wait
/// on network I/O except `open`, which binds the socket.
pub struct TransportSession {
    shared: Arc<SessionShared>,
}

impl TransportSession {
    pub fn new(id: ConnectionId, context: SessionContext, listener: Arc<dyn PacketListener>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = oneshot::channel();
        let released = Arc::new(AtomicBool::new(false));
        let lifecycle = {
            let released = released.clone();
            Lifecycle::with_release(move || {
                released.store(true, Ordering::SeqCst);
                let _ = release_tx.send(());
            })
        };
        let (selected, _) = watch::channel(None);

        Self {
            shared: Arc::new(SessionShared {
                id,
                context,
                listener,
                credentials: Credentials {
                    ufrag: random_token(8),
                    pwd: random_token(24),
                },
                state: Mutex::new(StateMachine::new()),
                counters: TransportCounters::default(),
                lifecycle,
                selected,
                send_path: Mutex::new(None),
                commands: commands_tx,
                pending: Mutex::new(Some((commands_rx, release_rx))),
                released,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Whether transport and crypto resources have been released
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn selected_remote(&self) -> Option<SocketAddr> {
        *self.shared.selected.borrow()
    }

    /// Gather host candidates, bind the socket and start connectivity checks
    pub async fn open(&self, config: &IceConfig) -> Result<LocalParameters, TransportError> {
        let state = self.state();
        if state != ConnectionState::New {
            return Err(TransportError::InvalidState(state));
        }
        let pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((commands, release)) = pending else {
            return Err(TransportError::InvalidState(state));
        };
        if !self.shared.transition(ConnectionState::IceGathering) {
            return Err(TransportError::InvalidState(self.state()));
        }

        let (socket, candidates) = match gather(config).await {
            Ok(gathered) => gathered,
            Err(e) => {
                self.shared.fail(FailureReason::SocketError { detail: e.to_string() });
                return Err(e);
            }
        };
        let socket = Arc::new(socket);
        let port = socket.local_addr()?.port();
        tracing::info!(
            connection = %self.shared.id,
            port,
            candidates = candidates.len(),
            "gathered host candidates"
        );

        let local = LocalParameters {
            ice_ufrag: self.shared.credentials.ufrag.clone(),
            ice_pwd: self.shared.credentials.pwd.clone(),
            fingerprint: self.shared.context.dtls.fingerprint(),
            candidates: candidates.clone(),
        };
        self.shared.emit(ConnectionEvent::CandidatesGathered {
            connection_id: self.shared.id,
            candidates,
        });
        if !self.shared.transition(ConnectionState::IceConnecting) {
            return Err(TransportError::InvalidState(self.state()));
        }

        let actor = SessionActor {
            shared: self.shared.clone(),
            agent: IceAgent::new(config, self.shared.credentials.clone(), Instant::now()),
            tick: config.check_interval(),
            socket,
            commands,
            release,
            remote: None,
            inbound: None,
            dtls_tx: None,
            early_dtls: Vec::new(),
            handshake: None,
            handshake_task: None,
            association: None,
        };
        self.shared
            .context
            .pools
            .io
            .spawn_for(self.shared.clone(), actor.run());
        Ok(local)
    }

    /// Add a trickled remote candidate. An empty string marks the end of
    /// candidates. After the session failed or closed this is a no-op.
    pub fn add_remote_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        let state = self.state();
        if state.is_terminal() {
            tracing::debug!(connection = %self.shared.id, %state, "ignoring remote candidate");
            return Ok(());
        }
        let candidate = candidate.trim();
        let command = if candidate.is_empty() || candidate == "a=end-of-candidates" {
            Command::EndOfCandidates
        } else {
            let parsed: IceCandidate = candidate.parse()?;
            if !state.accepts_candidates() {
                tracing::debug!(connection = %self.shared.id, %state, candidate = %parsed, "late remote candidate");
            }
            Command::AddCandidate(parsed)
        };
        if self.shared.commands.send(command).is_err() {
            tracing::debug!(connection = %self.shared.id, "session task gone, candidate dropped");
        }
        Ok(())
    }

    /// Remote ICE credentials and DTLS fingerprint/role. Must arrive before
    /// the session is ready; DTLS starts once ICE is also connected.
    pub fn set_remote_parameters(&self, params: RemoteParameters) -> Result<(), RelayError> {
        let state = self.state();
        if state == ConnectionState::Ready || state.is_terminal() {
            return Err(TransportError::InvalidState(state).into());
        }
        if !params.fingerprint.algorithm.eq_ignore_ascii_case("sha-256") {
            return Err(SecurityError::Handshake(format!(
                "unsupported fingerprint algorithm {}",
                params.fingerprint.algorithm
            ))
            .into());
        }
        self.shared
            .commands
            .send(Command::SetRemote(params))
            .map_err(|_| TransportError::SessionGone)?;
        Ok(())
    }

    /// Protect and send one RTP packet. Dropped and counted unless the
    /// session is ready.
    pub fn send_packet(&self, packet: &MediaPacket) -> bool {
        let counters = &self.shared.counters;
        let Some(_guard) = self.shared.lifecycle.enter() else {
            TransportCounters::bump(&counters.dropped_not_ready);
            return false;
        };
        if self.state() != ConnectionState::Ready {
            TransportCounters::bump(&counters.dropped_not_ready);
            return false;
        }
        match packet.marshal() {
            Ok(raw) => self.transmit(&raw, false),
            Err(e) => {
                TransportCounters::bump(&counters.malformed);
                tracing::debug!(connection = %self.shared.id, error = %e, "cannot serialise outgoing packet");
                false
            }
        }
    }

    /// Protect and send one compound RTCP packet
    pub fn send_rtcp(&self, rtcp: &[u8]) -> bool {
        let Some(_guard) = self.shared.lifecycle.enter() else {
            TransportCounters::bump(&self.shared.counters.dropped_not_ready);
            return false;
        };
        if self.state() != ConnectionState::Ready {
            TransportCounters::bump(&self.shared.counters.dropped_not_ready);
            return false;
        }
        self.transmit(rtcp, true)
    }

    fn transmit(&self, plaintext: &[u8], rtcp: bool) -> bool {
        let counters = &self.shared.counters;
        let Some(destination) = self.selected_remote() else {
            TransportCounters::bump(&counters.dropped_not_ready);
            return false;
        };
        let mut guard = self.shared.send_path();
        let Some(path) = guard.as_mut() else {
            TransportCounters::bump(&counters.dropped_not_ready);
            return false;
        };
        let protected = if rtcp {
            path.srtp.protect_rtcp(plaintext)
        } else {
            path.srtp.protect_rtp(plaintext)
        };
        let protected = match protected {
            Ok(protected) => protected,
            Err(e) => {
                tracing::debug!(connection = %self.shared.id, error = %e, "SRTP protect failed");
                return false;
            }
        };
        match path.socket.try_send_to(&protected, destination) {
            Ok(sent) => {
                if rtcp {
                    TransportCounters::bump(&counters.rtcp_sent);
                } else {
                    TransportCounters::bump(&counters.packets_sent);
                }
                TransportCounters::add(&counters.bytes_sent, sent as u64);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                TransportCounters::bump(&counters.dropped_queue_full);
                false
            }
            Err(e) => {
                tracing::debug!(connection = %self.shared.id, error = %e, "send failed");
                false
            }
        }
    }

    /// Close the session. Idempotent and non-blocking; resources are
    /// released once the last in-flight job finishes.
    pub fn close(&self) {
        self.shared.transition(ConnectionState::Closed);
        self.shared.lifecycle.close();
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Bind the session socket and build one host candidate per usable address
async fn gather(config: &IceConfig) -> Result<(UdpSocket, Vec<IceCandidate>), TransportError> {
    let hosts: Vec<IpAddr> = if config.host_addresses.is_empty() {
        vec![default_route_address().await?]
    } else {
        config
            .host_addresses
            .iter()
            .copied()
            .filter(|ip| !ip.is_unspecified() && !ip.is_multicast())
            .collect()
    };
    if hosts.is_empty() {
        return Err(TransportError::IceGathering("no usable host address".into()));
    }

    // One socket, one address family
    let ipv6 = hosts.iter().all(IpAddr::is_ipv6);
    let bind_ip = if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let socket = bind_in_range(bind_ip, config.port_min, config.port_max).await?;
    let port = socket.local_addr()?.port();

    let candidates = hosts
        .iter()
        .filter(|ip| ip.is_ipv6() == ipv6)
        .enumerate()
        .map(|(index, ip)| IceCandidate::host(SocketAddr::new(*ip, port), u16::MAX - index as u16))
        .collect();
    Ok((socket, candidates))
}

/// Address of the interface holding the default route. Connecting a UDP
/// socket picks a route without sending anything.
async fn default_route_address() -> Result<IpAddr, TransportError> {
    for (bind, target) in [("0.0.0.0:0", "192.0.2.1:9"), ("[::]:0", "[2001:db8::1]:9")] {
        let Ok(socket) = UdpSocket::bind(bind).await else {
            continue;
        };
        if socket.connect(target).await.is_err() {
            continue;
        }
        if let Ok(local) = socket.local_addr() {
            if !local.ip().is_unspecified() {
                return Ok(local.ip());
            }
        }
    }
    Err(TransportError::IceGathering("no default route".into()))
}

async fn bind_in_range(ip: IpAddr, min: u16, max: u16) -> Result<UdpSocket, TransportError> {
    if min == 0 {
        return Ok(UdpSocket::bind(SocketAddr::new(ip, 0)).await?);
    }
    let max = max.max(min);
    for port in min..=max {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransportError::IceGathering(format!("no free UDP port in {min}-{max}")))
}

async fn recv_handshake(
    rx: &mut Option<oneshot::Receiver<Result<Established, SecurityError>>>,
) -> Result<Result<Established, SecurityError>, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

/// Handshake, then SRTP key derivation, both on the CPU pool.
///
/// The handshake future is driven by a CPU worker through the I/O runtime's
/// handle, so its crypto never runs on an I/O thread while its socket and
/// timers stay on the I/O runtime. It is not tied to the session lifecycle:
/// teardown closes its transport, which ends it.
async fn establish(
    shared: Arc<SessionShared>,
    transport: DtlsTransport,
    remote: RemoteParameters,
) -> Result<Established, SecurityError> {
    let role = remote.setup.local_role();
    let timeout = shared.context.dtls_config.handshake_timeout();
    let engine = shared.context.dtls.clone();
    let io = shared.context.pools.io.handle().clone();
    let outcome = shared
        .context
        .pools
        .cpu
        .run(JobPriority::Control, move || {
            io.block_on(tokio::time::timeout(
                timeout,
                engine.handshake(transport, role, remote.fingerprint),
            ))
        })
        .await
        .map_err(|e| SecurityError::Handshake(e.to_string()))?
        .map_err(|_| SecurityError::HandshakeTimeout(timeout))??;

    let material = outcome.keying_material;
    let cpu = shared.context.pools.cpu.clone();
    let (inbound, outbound) = cpu
        .run_for(shared, JobPriority::Control, move |_| srtp::derive(&material, role))
        .await
        .map_err(|e| SecurityError::Srtp(e.to_string()))??;
    Ok(Established {
        inbound,
        outbound,
        association: outcome.association,
    })
}

/// Owns the socket and drives the ICE agent, the DTLS handoff and inbound
/// SRTP for one session
struct SessionActor {
    shared: Arc<SessionShared>,
    agent: IceAgent,
    tick: std::time::Duration,
    socket: Arc<UdpSocket>,
    commands: mpsc::UnboundedReceiver<Command>,
    release: oneshot::Receiver<()>,
    remote: Option<RemoteParameters>,
    inbound: Option<InboundSrtp>,
    dtls_tx: Option<mpsc::Sender<Bytes>>,
    early_dtls: Vec<Bytes>,
    handshake: Option<oneshot::Receiver<Result<Established, SecurityError>>>,
    handshake_task: Option<JoinHandle<()>>,
    association: Option<Arc<dyn DtlsAssociation>>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut self.release => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                    ) => {
                        tracing::debug!(connection = %self.shared.id, error = %e, "ignoring ICMP error");
                    }
                    Err(e) => self.shared.fail(FailureReason::SocketError { detail: e.to_string() }),
                },
                _ = ticker.tick() => self.agent.handle_timeout(Instant::now()),
                result = recv_handshake(&mut self.handshake) => {
                    self.handshake = None;
                    self.handle_established(result);
                }
            }
            self.process_agent().await;
        }

        self.teardown().await;
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::AddCandidate(candidate) => {
                let ours_v6 = self.socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
                if candidate.address.is_ipv6() != ours_v6 {
                    tracing::debug!(connection = %self.shared.id, candidate = %candidate, "skipping candidate of other address family");
                    return;
                }
                tracing::debug!(connection = %self.shared.id, candidate = %candidate, "remote candidate added");
                self.agent.add_remote_candidate(&candidate, now);
            }
            Command::EndOfCandidates => self.agent.set_end_of_candidates(),
            Command::SetRemote(params) => {
                self.agent.set_remote_credentials(Credentials {
                    ufrag: params.ice_ufrag.clone(),
                    pwd: params.ice_pwd.clone(),
                });
                if self.dtls_tx.is_some() {
                    tracing::debug!(connection = %self.shared.id, "DTLS already started, keeping original fingerprint");
                } else {
                    self.remote = Some(params);
                    self.maybe_start_dtls();
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let counters = &self.shared.counters;
        TransportCounters::add(&counters.bytes_received, data.len() as u64);

        match classify(data) {
            DatagramKind::Stun => match self.agent.handle_stun(from, data, Instant::now()) {
                Ok(StunOutcome::Request) => {
                    TransportCounters::bump(&counters.stun_requests);
                }
                Ok(StunOutcome::Response) => {}
                Err(e) => {
                    let malformed = TransportCounters::bump(&counters.malformed);
                    if malformed == 1 || malformed % 100 == 0 {
                        tracing::debug!(connection = %self.shared.id, remote = %from, error = %e, "discarding STUN message");
                    }
                }
            },
            DatagramKind::Dtls => self.handle_dtls(data, from),
            kind @ (DatagramKind::Rtp | DatagramKind::Rtcp) => {
                if self.agent.selected_remote() != Some(from) {
                    TransportCounters::bump(&counters.dropped_unknown_source);
                    return;
                }
                let Some(inbound) = self.inbound.as_mut() else {
                    TransportCounters::bump(&counters.dropped_not_ready);
                    return;
                };
                // Nothing reaches the listener once the session is closed
                let Some(_guard) = self.shared.lifecycle.enter() else {
                    return;
                };
                inbound.deliver(
                    self.shared.id,
                    data,
                    kind == DatagramKind::Rtcp,
                    self.shared.listener.as_ref(),
                    &self.shared.counters,
                );
            }
            DatagramKind::Unknown => {
                TransportCounters::bump(&counters.malformed);
            }
        }
    }

    fn handle_dtls(&mut self, data: &[u8], from: SocketAddr) {
        let counters = &self.shared.counters;
        let selected = self.agent.selected_remote();
        let acceptable = selected == Some(from) || (selected.is_none() && self.agent.is_known_remote(from));
        if !acceptable {
            TransportCounters::bump(&counters.dropped_unknown_source);
            return;
        }
        let record = Bytes::copy_from_slice(data);
        match &self.dtls_tx {
            Some(tx) => {
                if tx.try_send(record).is_err() {
                    TransportCounters::bump(&counters.dropped_queue_full);
                }
            }
            // Peer started its handshake before we finished ICE
            None if self.early_dtls.len() < MAX_EARLY_DTLS => self.early_dtls.push(record),
            None => {
                TransportCounters::bump(&counters.dropped_queue_full);
            }
        }
    }

    async fn process_agent(&mut self) {
        while let Some(transmit) = self.agent.poll_transmit() {
            if let Err(e) = self.socket.send_to(&transmit.contents, transmit.destination).await {
                tracing::debug!(connection = %self.shared.id, remote = %transmit.destination, error = %e, "STUN send failed");
            }
        }

        while let Some(event) = self.agent.poll_event() {
            let id = self.shared.id;
            match event {
                IceEvent::Connected(remote) => {
                    self.shared.selected.send_replace(Some(remote));
                    tracing::info!(connection = %id, %remote, "ICE connected");
                    if self.shared.transition(ConnectionState::IceConnected) {
                        self.maybe_start_dtls();
                    }
                }
                IceEvent::ConnectivityLost => {
                    tracing::warn!(connection = %id, "ICE connectivity lost, checks restarted");
                    self.shared.emit(ConnectionEvent::ConnectivityLost { connection_id: id });
                }
                IceEvent::ConnectivityRestored(remote) => {
                    self.shared.selected.send_replace(Some(remote));
                    tracing::info!(connection = %id, %remote, "ICE connectivity restored");
                    self.shared.emit(ConnectionEvent::ConnectivityRestored { connection_id: id });
                }
                IceEvent::Failed(reason) => {
                    tracing::warn!(connection = %id, %reason, "ICE failed");
                    self.shared.fail(FailureReason::IceFailed);
                }
            }
        }
    }

    fn maybe_start_dtls(&mut self) {
        if self.dtls_tx.is_some() || self.shared.state() != ConnectionState::IceConnected {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };
        if !self.shared.transition(ConnectionState::DtlsHandshaking) {
            return;
        }

        let (tx, rx) = mpsc::channel(DTLS_CHANNEL_CAPACITY);
        for record in self.early_dtls.drain(..) {
            let _ = tx.try_send(record);
        }
        self.dtls_tx = Some(tx);

        let transport = DtlsTransport::new(rx, self.socket.clone(), self.shared.selected.subscribe());
        let (done_tx, done_rx) = oneshot::channel();
        self.handshake = Some(done_rx);
        tracing::info!(connection = %self.shared.id, role = ?remote.setup.local_role(), "starting DTLS handshake");

        let shared = self.shared.clone();
        self.handshake_task = Some(self.shared.context.pools.io.spawn(async move {
            let result = establish(shared, transport, remote).await;
            let _ = done_tx.send(result);
        }));
    }

    fn handle_established(
        &mut self,
        result: Result<Result<Established, SecurityError>, oneshot::error::RecvError>,
    ) {
        let id = self.shared.id;
        match result {
            Ok(Ok(established)) => {
                *self.shared.send_path() = Some(SendPath {
                    srtp: established.outbound,
                    socket: self.socket.clone(),
                });
                self.inbound = Some(established.inbound);
                self.association = established.association;
                if self.shared.transition(ConnectionState::Ready) {
                    tracing::info!(connection = %id, "DTLS established, SRTP ready");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "fanout::security", connection = %id, error = %e, "DTLS handshake failed");
                self.shared.fail(e.failure_reason());
            }
            Err(_) => self.shared.fail(FailureReason::HandshakeFailed {
                detail: "handshake task ended without a result".into(),
            }),
        }
    }

    async fn teardown(mut self) {
        if let Some(task) = self.handshake_task.take() {
            task.abort();
        }
        self.dtls_tx = None;
        self.inbound = None;
        self.shared.send_path().take();
        self.shared.selected.send_replace(None);
        if let Some(association) = self.association.take() {
            association.close().await;
        }
        tracing::debug!(connection = %self.shared.id, "transport resources released");
    }
}
