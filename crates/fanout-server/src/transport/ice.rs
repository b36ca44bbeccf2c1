//! Sans-IO ICE agent
//!
//! The agent never touches a socket. The session feeds it received STUN
//! datagrams and clock ticks, then drains [`Transmit`]s and [`IceEvent`]s.
//! Nomination is aggressive: the controlling side puts USE-CANDIDATE on every
//! check and selects the first pair that succeeds; the controlled side selects
//! the pair a nominating request arrived on.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fanout_protocol::{CandidateType, IceCandidate};

use super::stun::{self, Credentials, RoleAttribute, StunError, StunMessage};
use crate::config::{IceConfig, IceRole};

/// Checks sent to one pair before it is given up while connecting
const MAX_CHECK_ATTEMPTS: u32 = 9;

/// Outstanding transactions older than this are forgotten
const TRANSACTION_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    Connected(SocketAddr),
    ConnectivityLost,
    ConnectivityRestored(SocketAddr),
    Failed(String),
}

/// What a received STUN message turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunOutcome {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct CandidatePair {
    remote: SocketAddr,
    priority: u32,
    state: PairState,
    next_check: Instant,
    interval: Duration,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    Checking,
    Connected,
    Disconnected { since: Instant },
    Failed,
}

pub struct IceAgent {
    role: IceRole,
    tiebreaker: u64,
    local: Credentials,
    remote: Option<Credentials>,
    check_interval: Duration,
    max_check_interval: Duration,
    keepalive_interval: Duration,
    connect_timeout: Duration,
    disconnected_timeout: Duration,
    failed_timeout: Duration,
    pairs: Vec<CandidatePair>,
    transactions: HashMap<[u8; 12], (SocketAddr, Instant)>,
    selected: Option<SocketAddr>,
    connectivity: Connectivity,
    started: Instant,
    last_received: Option<Instant>,
    last_keepalive: Option<Instant>,
    end_of_candidates: bool,
    transmits: VecDeque<Transmit>,
    events: VecDeque<IceEvent>,
}

impl IceAgent {
    pub fn new(config: &IceConfig, local: Credentials, now: Instant) -> Self {
        Self {
            role: config.role,
            tiebreaker: rand::random(),
            local,
            remote: None,
            check_interval: config.check_interval(),
            max_check_interval: config.max_check_interval(),
            keepalive_interval: config.keepalive_interval(),
            connect_timeout: config.connect_timeout(),
            disconnected_timeout: config.disconnected_timeout(),
            failed_timeout: config.failed_timeout(),
            pairs: Vec::new(),
            transactions: HashMap::new(),
            selected: None,
            connectivity: Connectivity::Checking,
            started: now,
            last_received: None,
            last_keepalive: None,
            end_of_candidates: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn set_remote_credentials(&mut self, remote: Credentials) {
        if self.remote.as_ref() != Some(&remote) {
            self.transactions.clear();
        }
        self.remote = Some(remote);
    }

    pub fn add_remote_candidate(&mut self, candidate: &IceCandidate, now: Instant) {
        self.add_pair(candidate.socket_addr(), candidate.priority, now);
    }

    pub fn set_end_of_candidates(&mut self) {
        self.end_of_candidates = true;
    }

    pub fn selected_remote(&self) -> Option<SocketAddr> {
        self.selected
    }

    /// Whether `addr` belongs to a known candidate pair
    pub fn is_known_remote(&self, addr: SocketAddr) -> bool {
        self.pairs.iter().any(|p| p.remote == addr)
    }

    pub fn is_failed(&self) -> bool {
        self.connectivity == Connectivity::Failed
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    fn add_pair(&mut self, remote: SocketAddr, priority: u32, now: Instant) -> bool {
        if self.is_known_remote(remote) {
            return false;
        }
        self.pairs.push(CandidatePair {
            remote,
            priority,
            state: PairState::Waiting,
            next_check: now,
            interval: self.check_interval,
            attempts: 0,
        });
        // Highest remote priority is checked first
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    fn local_priority() -> u32 {
        IceCandidate::compute_priority(CandidateType::Prflx, u16::MAX, 1)
    }

    fn role_attribute(&self) -> RoleAttribute {
        match self.role {
            IceRole::Controlling => RoleAttribute::Controlling(self.tiebreaker),
            IceRole::Controlled => RoleAttribute::Controlled(self.tiebreaker),
        }
    }

    /// Handle a STUN datagram received from `from`
    pub fn handle_stun(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Result<StunOutcome, StunError> {
        if self.connectivity == Connectivity::Failed {
            return Err(StunError::Unsupported);
        }
        match stun::decode(data, &self.local, self.remote.as_ref())? {
            StunMessage::Request(request) => {
                let response = stun::binding_success(request.transaction_id, from, &self.local)?;
                self.transmits.push_back(Transmit {
                    destination: from,
                    contents: response,
                });

                let priority = request.priority.unwrap_or_else(Self::local_priority);
                if self.add_pair(from, priority, now) {
                    tracing::debug!(remote = %from, "learned peer-reflexive candidate");
                } else if let Some(pair) = self.pairs.iter_mut().find(|p| p.remote == from) {
                    // Triggered check
                    if pair.state == PairState::Waiting {
                        pair.next_check = now;
                    }
                }

                self.refresh(from, now);
                if request.use_candidate && self.role == IceRole::Controlled {
                    self.select(from, now);
                }
                Ok(StunOutcome::Request)
            }
            StunMessage::Response(response) => {
                let Some((destination, _)) = self.transactions.remove(&response.transaction_id) else {
                    return Err(StunError::Unsupported);
                };
                if destination != from {
                    return Err(StunError::Unsupported);
                }
                if let Some(pair) = self.pairs.iter_mut().find(|p| p.remote == from) {
                    pair.state = PairState::Succeeded;
                }
                self.refresh(from, now);
                if self.role == IceRole::Controlling {
                    self.select(from, now);
                }
                Ok(StunOutcome::Response)
            }
        }
    }

    /// Authenticated STUN traffic from the selected pair keeps consent fresh
    fn refresh(&mut self, from: SocketAddr, now: Instant) {
        if self.selected != Some(from) {
            return;
        }
        self.last_received = Some(now);
        if let Connectivity::Disconnected { .. } = self.connectivity {
            self.connectivity = Connectivity::Connected;
            self.events.push_back(IceEvent::ConnectivityRestored(from));
        }
    }

    fn select(&mut self, remote: SocketAddr, now: Instant) {
        match self.connectivity {
            Connectivity::Checking => {
                self.selected = Some(remote);
                self.connectivity = Connectivity::Connected;
                self.last_received = Some(now);
                self.last_keepalive = Some(now);
                self.events.push_back(IceEvent::Connected(remote));
            }
            Connectivity::Disconnected { .. } => {
                self.selected = Some(remote);
                self.connectivity = Connectivity::Connected;
                self.last_received = Some(now);
                self.events.push_back(IceEvent::ConnectivityRestored(remote));
            }
            Connectivity::Connected | Connectivity::Failed => {}
        }
    }

    fn fail(&mut self, reason: String) {
        self.connectivity = Connectivity::Failed;
        self.transmits.clear();
        self.events.push_back(IceEvent::Failed(reason));
    }

    /// Drive timers: connectivity checks, keepalives and timeouts
    pub fn handle_timeout(&mut self, now: Instant) {
        self.transactions
            .retain(|_, (_, sent)| now.duration_since(*sent) < TRANSACTION_TTL);

        match self.connectivity {
            Connectivity::Failed => return,
            Connectivity::Checking => {
                if now.duration_since(self.started) >= self.connect_timeout {
                    self.fail(format!(
                        "no candidate pair succeeded within {:?} ({} pairs)",
                        self.connect_timeout,
                        self.pairs.len()
                    ));
                    return;
                }
            }
            Connectivity::Connected => {
                let silent_since = self.last_received.unwrap_or(self.started);
                if now.duration_since(silent_since) >= self.disconnected_timeout {
                    self.connectivity = Connectivity::Disconnected { since: now };
                    self.events.push_back(IceEvent::ConnectivityLost);
                    self.restart_checks(now);
                }
            }
            Connectivity::Disconnected { since } => {
                if now.duration_since(since) >= self.failed_timeout {
                    self.fail(format!("connectivity not restored within {:?}", self.failed_timeout));
                    return;
                }
            }
        }

        if self.remote.is_none() {
            return;
        }
        match self.connectivity {
            Connectivity::Connected => self.send_keepalive(now),
            Connectivity::Checking | Connectivity::Disconnected { .. } => self.send_checks(now),
            Connectivity::Failed => {}
        }
    }

    fn restart_checks(&mut self, now: Instant) {
        for pair in &mut self.pairs {
            pair.state = PairState::Waiting;
            pair.next_check = now;
            pair.interval = self.check_interval;
            pair.attempts = 0;
        }
    }

    fn send_checks(&mut self, now: Instant) {
        let disconnected = matches!(self.connectivity, Connectivity::Disconnected { .. });
        let due: Vec<SocketAddr> = self
            .pairs
            .iter_mut()
            .filter(|p| matches!(p.state, PairState::Waiting | PairState::InProgress) && p.next_check <= now)
            .filter_map(|pair| {
                if pair.attempts >= MAX_CHECK_ATTEMPTS && !disconnected {
                    pair.state = PairState::Failed;
                    return None;
                }
                pair.state = PairState::InProgress;
                pair.attempts += 1;
                pair.next_check = now + pair.interval;
                pair.interval = (pair.interval * 2).min(self.max_check_interval);
                Some(pair.remote)
            })
            .collect();

        for remote in due {
            self.send_check(remote, self.role == IceRole::Controlling, now);
        }

        let exhausted = !self.pairs.is_empty() && self.pairs.iter().all(|p| p.state == PairState::Failed);
        if exhausted && self.end_of_candidates && !disconnected {
            self.fail(format!("all {} candidate pairs failed", self.pairs.len()));
        }
    }

    fn send_keepalive(&mut self, now: Instant) {
        let Some(selected) = self.selected else { return };
        let last = self.last_keepalive.unwrap_or(self.started);
        if now.duration_since(last) < self.keepalive_interval {
            return;
        }
        self.last_keepalive = Some(now);
        self.send_check(selected, false, now);
    }

    fn send_check(&mut self, destination: SocketAddr, use_candidate: bool, now: Instant) {
        let Some(remote) = self.remote.as_ref() else { return };
        match stun::binding_request(
            &self.local,
            remote,
            Self::local_priority(),
            self.role_attribute(),
            use_candidate,
        ) {
            Ok((transaction_id, contents)) => {
                self.transactions.insert(transaction_id, (destination, now));
                self.transmits.push_back(Transmit { destination, contents });
            }
            Err(e) => tracing::warn!(remote = %destination, error = %e, "failed to build connectivity check"),
        }
    }
}
