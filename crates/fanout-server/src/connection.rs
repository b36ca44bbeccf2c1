//! Connections: anything that can publish into or subscribe from a router.
//!
//! A live WebRTC transport and the file/synthetic endpoints all sit behind
//! one `Connection` type so the router and relay never care which is which.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fanout_media::{JitterBuffer, JitterConfig, MediaPacket, StreamRewriter, TransformChain};
use fanout_protocol::{
    CodecParameters, ConnectionId, ConnectionState, ConnectionStats, MediaKind, PipelineStats, RouterId,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::util::Marshal;

use crate::config::PipelineConfig;
use crate::endpoint::{FeedSlot, FileSink, FileSource, SyntheticSource};
use crate::pool::{PacketQueue, PushOutcome};
use crate::router::{MediaSink, MediaSource, Router};
use crate::transport::{PacketListener, SessionContext, TransportSession};

/// Minimum spacing between keyframe requests sent to a live peer
const PLI_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    LiveTransport,
    FileSource,
    SyntheticSource,
    FileSink,
}

impl ConnectionKind {
    pub fn can_publish(&self) -> bool {
        !matches!(self, ConnectionKind::FileSink)
    }

    pub fn can_subscribe(&self) -> bool {
        matches!(self, ConnectionKind::LiveTransport | ConnectionKind::FileSink)
    }
}

fn rate_limited(count: u64) -> bool {
    count == 1 || count % 100 == 0
}

/// Receive side of a live connection: decrypted RTP is classified by
/// payload type, reordered per media kind and pushed into the router feed.
struct LiveInbound {
    connection_id: ConnectionId,
    codecs: Vec<CodecParameters>,
    jitter: JitterConfig,
    chains: Mutex<HashMap<MediaKind, TransformChain>>,
    feed: FeedSlot,
    /// Routers this connection subscribes to; RTCP keyframe requests go there
    upstream: Mutex<Vec<Router>>,
    video_ssrc: AtomicU32,
    packets: AtomicU64,
    unknown_payload_type: AtomicU64,
    malformed: AtomicU64,
}

impl LiveInbound {
    fn new(connection_id: ConnectionId, codecs: Vec<CodecParameters>, jitter: JitterConfig) -> Self {
        Self {
            connection_id,
            codecs,
            jitter,
            chains: Mutex::new(HashMap::new()),
            feed: FeedSlot::default(),
            upstream: Mutex::new(Vec::new()),
            video_ssrc: AtomicU32::new(0),
            packets: AtomicU64::new(0),
            unknown_payload_type: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    fn chains(&self) -> MutexGuard<'_, HashMap<MediaKind, TransformChain>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upstream(&self) -> MutexGuard<'_, Vec<Router>> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, feed: PacketQueue<MediaPacket>) {
        self.chains().clear();
        self.feed.set(Some(feed));
    }

    fn detach(&self) {
        self.feed.set(None);
        self.chains().clear();
    }

    fn report(&self, stats: &mut PipelineStats) {
        stats.inbound_packets += self.packets.load(Ordering::Relaxed);
        stats.unknown_payload_type += self.unknown_payload_type.load(Ordering::Relaxed);
        for chain in self.chains().values() {
            chain.report(stats);
        }
    }
}

impl PacketListener for LiveInbound {
    fn on_rtp(&self, raw: Bytes) {
        let codec = MediaPacket::peek_payload_type(&raw)
            .and_then(|pt| self.codecs.iter().find(|c| c.payload_type == pt));
        let Some(codec) = codec else {
            let unknown = self.unknown_payload_type.fetch_add(1, Ordering::Relaxed) + 1;
            if rate_limited(unknown) {
                tracing::debug!(
                    connection = %self.connection_id,
                    payload_type = ?MediaPacket::peek_payload_type(&raw),
                    unknown,
                    "dropping packet with unnegotiated payload type"
                );
            }
            return;
        };
        let packet = match MediaPacket::parse(&raw, codec.kind(), Instant::now()) {
            Ok(packet) => packet,
            Err(e) => {
                let malformed = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                if rate_limited(malformed) {
                    tracing::debug!(connection = %self.connection_id, error = %e, malformed, "dropping malformed RTP");
                }
                return;
            }
        };
        self.packets.fetch_add(1, Ordering::Relaxed);
        if packet.kind() == MediaKind::Video {
            self.video_ssrc.store(packet.ssrc(), Ordering::Relaxed);
        }

        let jitter = self.jitter;
        let released = self
            .chains()
            .entry(packet.kind())
            .or_insert_with(|| TransformChain::new().with_stage(JitterBuffer::new(jitter)))
            .process(packet);
        for packet in released {
            self.feed.push(packet);
        }
    }

    fn on_rtcp(&self, raw: Bytes) {
        let mut buf = raw;
        let packets = match webrtc::rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::debug!(connection = %self.connection_id, error = %e, "unparseable RTCP");
                return;
            }
        };
        let wants_keyframe = packets.iter().any(|p| {
            let any = p.as_any();
            any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>()
        });
        if !wants_keyframe {
            return;
        }
        let routers = self.upstream().clone();
        tracing::debug!(connection = %self.connection_id, routers = routers.len(), "peer requested a keyframe");
        for router in routers {
            router.request_keyframe();
        }
    }
}

struct LiveBackend {
    session: TransportSession,
    inbound: Arc<LiveInbound>,
    outbound: PacketQueue<MediaPacket>,
    outbound_sent: Arc<AtomicU64>,
    /// SSRCs this side sends with, per media kind
    video_ssrc: u32,
    last_pli: Mutex<Option<Instant>>,
    drain: JoinHandle<()>,
}

impl LiveBackend {
    fn send_pli(&self, connection_id: ConnectionId) {
        let media_ssrc = self.inbound.video_ssrc.load(Ordering::Relaxed);
        if media_ssrc == 0 {
            tracing::debug!(connection = %connection_id, "no inbound video yet, keyframe request skipped");
            return;
        }
        {
            let mut last = self.last_pli.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < PLI_INTERVAL) {
                return;
            }
            *last = Some(now);
        }
        let pli = PictureLossIndication {
            sender_ssrc: self.video_ssrc,
            media_ssrc,
        };
        match pli.marshal() {
            Ok(raw) => {
                if self.session.send_rtcp(&raw) {
                    tracing::debug!(connection = %connection_id, media_ssrc, "sent PLI");
                }
            }
            Err(e) => tracing::debug!(connection = %connection_id, error = %e, "cannot build PLI"),
        }
    }
}

enum Backend {
    Live(LiveBackend),
    FileSource(FileSource),
    Synthetic(SyntheticSource),
    FileSink(FileSink),
}

pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    codecs: Vec<CodecParameters>,
    backend: Backend,
    closed: AtomicBool,
}

impl Connection {
    /// A WebRTC connection. The transport starts in `New`; call
    /// `session().open()` to gather candidates.
    pub fn live(
        id: ConnectionId,
        codecs: Vec<CodecParameters>,
        context: SessionContext,
        pipeline: &PipelineConfig,
    ) -> Arc<Self> {
        let inbound = Arc::new(LiveInbound::new(id, codecs.clone(), pipeline.jitter()));
        let outbound = context.pools.io.queue_with_capacity(pipeline.outbound_queue_capacity);
        let outbound_sent = Arc::new(AtomicU64::new(0));
        let audio_ssrc: u32 = rand::random();
        let video_ssrc: u32 = rand::random();
        let io = context.pools.io.clone();
        let session = TransportSession::new(id, context, inbound.clone());

        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let drain = io.spawn(drain_outbound(
                weak.clone(),
                outbound.clone(),
                StreamRewriter::new()
                    .with_ssrc(MediaKind::Audio, audio_ssrc)
                    .with_ssrc(MediaKind::Video, video_ssrc),
            ));
            Connection {
                id,
                kind: ConnectionKind::LiveTransport,
                codecs,
                backend: Backend::Live(LiveBackend {
                    session,
                    inbound,
                    outbound,
                    outbound_sent,
                    video_ssrc,
                    last_pli: Mutex::new(None),
                    drain,
                }),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn file_source(source: FileSource) -> Arc<Self> {
        Arc::new(Self {
            id: source.id(),
            kind: ConnectionKind::FileSource,
            codecs: source.codecs().to_vec(),
            backend: Backend::FileSource(source),
            closed: AtomicBool::new(false),
        })
    }

    pub fn synthetic(source: SyntheticSource) -> Arc<Self> {
        Arc::new(Self {
            id: source.id(),
            kind: ConnectionKind::SyntheticSource,
            codecs: source.codecs().to_vec(),
            backend: Backend::Synthetic(source),
            closed: AtomicBool::new(false),
        })
    }

    pub fn file_sink(sink: FileSink) -> Arc<Self> {
        Arc::new(Self {
            id: sink.id(),
            kind: ConnectionKind::FileSink,
            codecs: sink.codecs().to_vec(),
            backend: Backend::FileSink(sink),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn negotiated_codecs(&self) -> &[CodecParameters] {
        &self.codecs
    }

    pub fn session(&self) -> Option<&TransportSession> {
        match &self.backend {
            Backend::Live(live) => Some(&live.session),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transport state for live connections. Endpoints have no handshake and
    /// are `Ready` until closed.
    pub fn state(&self) -> ConnectionState {
        match &self.backend {
            Backend::Live(live) => live.session.state(),
            _ if self.is_closed() => ConnectionState::Closed,
            _ => ConnectionState::Ready,
        }
    }

    /// Remember a router this connection subscribes to, so the peer's
    /// keyframe requests reach its publisher
    pub fn add_upstream(&self, router: Router) {
        if let Backend::Live(live) = &self.backend {
            let mut upstream = live.inbound.upstream();
            upstream.retain(|r| r.id() != router.id());
            upstream.push(router);
        }
    }

    pub fn remove_upstream(&self, router_id: RouterId) {
        if let Backend::Live(live) = &self.backend {
            live.inbound.upstream().retain(|r| r.id() != router_id);
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut pipeline = PipelineStats::default();
        let mut transport = None;
        match &self.backend {
            Backend::Live(live) => {
                live.inbound.report(&mut pipeline);
                pipeline.outbound_packets = live.outbound_sent.load(Ordering::Relaxed);
                pipeline.outbound_dropped = live.outbound.dropped();
                transport = Some(live.session.stats());
            }
            Backend::FileSource(source) => pipeline.inbound_packets = source.packets_sent(),
            Backend::Synthetic(source) => pipeline.inbound_packets = source.frames_generated(),
            Backend::FileSink(sink) => {
                pipeline.outbound_packets = sink.packets_written();
                pipeline.outbound_dropped = sink.dropped();
            }
        }
        ConnectionStats {
            connection_id: self.id,
            state: self.state(),
            transport,
            pipeline,
        }
    }

    /// Wait for a file sink to write everything it was handed. `None` for
    /// other kinds.
    pub async fn finish_recording(&self) -> Option<io::Result<u64>> {
        match &self.backend {
            Backend::FileSink(sink) => Some(sink.finish().await),
            _ => None,
        }
    }

    /// Tear the connection down. Idempotent and non-blocking.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.backend {
            Backend::Live(live) => {
                live.session.close();
                live.outbound.close_and_clear();
                live.inbound.detach();
                live.inbound.upstream().clear();
            }
            Backend::FileSource(source) => source.detach(),
            Backend::Synthetic(source) => source.detach(),
            Backend::FileSink(sink) => sink.close(),
        }
        tracing::info!(connection = %self.id, kind = ?self.kind, "connection closed");
    }

    fn send_outbound(&self, packet: &MediaPacket) {
        if let Backend::Live(live) = &self.backend {
            if live.session.send_packet(packet) {
                live.outbound_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Backend::Live(live) = &self.backend {
            live.drain.abort();
        }
    }
}

async fn drain_outbound(connection: Weak<Connection>, queue: PacketQueue<MediaPacket>, rewriter: StreamRewriter) {
    let mut chain = TransformChain::new().with_stage(rewriter);
    while let Some(packet) = queue.pop().await {
        let Some(connection) = connection.upgrade() else { break };
        for packet in chain.process(packet) {
            connection.send_outbound(&packet);
        }
    }
}

impl MediaSource for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn codecs(&self) -> Vec<CodecParameters> {
        self.codecs.clone()
    }

    fn attach(&self, feed: PacketQueue<MediaPacket>) {
        match &self.backend {
            Backend::Live(live) => live.inbound.attach(feed),
            Backend::FileSource(source) => source.attach(feed),
            Backend::Synthetic(source) => source.attach(feed),
            Backend::FileSink(_) => {
                tracing::warn!(connection = %self.id, "file sink cannot publish");
            }
        }
    }

    fn detach(&self) {
        match &self.backend {
            Backend::Live(live) => live.inbound.detach(),
            Backend::FileSource(source) => source.detach(),
            Backend::Synthetic(source) => source.detach(),
            Backend::FileSink(_) => {}
        }
    }

    fn request_keyframe(&self) {
        match &self.backend {
            Backend::Live(live) => live.send_pli(self.id),
            Backend::Synthetic(source) => source.request_keyframe(),
            Backend::FileSource(_) => {
                tracing::debug!(connection = %self.id, "file source cannot produce keyframes on demand");
            }
            Backend::FileSink(_) => {}
        }
    }
}

impl MediaSink for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn codecs(&self) -> Vec<CodecParameters> {
        self.codecs.clone()
    }

    fn deliver(&self, packet: MediaPacket) {
        let outcome = match &self.backend {
            Backend::Live(live) => live.outbound.push(packet),
            Backend::FileSink(sink) => sink.deliver(packet),
            Backend::FileSource(_) | Backend::Synthetic(_) => return,
        };
        if matches!(outcome, PushOutcome::Evicted | PushOutcome::Dropped) {
            let dropped = match &self.backend {
                Backend::Live(live) => live.outbound.dropped(),
                Backend::FileSink(sink) => sink.dropped(),
                _ => 0,
            };
            if rate_limited(dropped) {
                tracing::warn!(connection = %self.id, dropped, "outbound queue full, dropping packets");
            }
        }
    }
}
