//! One-to-many media router
//!
//! A router takes packets from one publisher and hands them to every
//! subscriber, directly when the subscriber negotiated the same codec and
//! through the CPU pool when it needs transcoding.
//!
//! The subscriber table is copy-on-write: `deliver` clones an `Arc` snapshot
//! under a short read lock and works on that, so adding or removing a
//! subscriber never waits for packets in flight.

mod subscription;
mod transcode;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use fanout_media::{CodecFactory, MediaPacket};
use fanout_protocol::{CodecParameters, ConnectionId, RouterId, RouterStats};
use tokio::task::JoinHandle;

pub use subscription::{Route, Subscription, TranscoderContext, compute_routes};
pub use transcode::{TargetOutput, TranscodeEngine};

use crate::config::RouterConfig;
use crate::error::{PoolError, RelayError, Result};
use crate::pool::{JobOwner, JobPriority, Lifecycle, PacketQueue, Pools};

/// Something a router can send packets to
pub trait MediaSink: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Codecs this sink negotiated, in preference order
    fn codecs(&self) -> Vec<CodecParameters>;

    /// Take one packet. Called from the router's feeder task in publisher
    /// order; must not block.
    fn deliver(&self, packet: MediaPacket);
}

/// Something that can publish into a router
pub trait MediaSource: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn codecs(&self) -> Vec<CodecParameters>;

    /// Start pushing received packets into `feed`
    fn attach(&self, feed: PacketQueue<MediaPacket>);

    fn detach(&self);

    fn request_keyframe(&self);
}

struct Publisher {
    source: Arc<dyn MediaSource>,
    codecs: Vec<CodecParameters>,
    feed: PacketQueue<MediaPacket>,
    generation: u64,
}

#[derive(Clone, Default)]
struct RouteTable {
    publisher: Option<Arc<Publisher>>,
    subscriptions: Vec<Arc<Subscription>>,
    /// Cleared when the publisher's transport fails
    source_active: bool,
}

#[derive(Default)]
struct RouterCounters {
    packets_in: AtomicU64,
    relayed: AtomicU64,
    transcoded: AtomicU64,
    decodes: AtomicU64,
    encodes: AtomicU64,
    codec_errors: AtomicU64,
    unknown_payload_type: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_overload: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

struct RouterShared {
    id: RouterId,
    pools: Pools,
    config: RouterConfig,
    table: RwLock<Arc<RouteTable>>,
    engine: Mutex<TranscodeEngine>,
    /// Bumped together with the table swap whenever the publisher changes
    generation: AtomicU64,
    /// Serialises publisher changes so table, feeder and source attachment
    /// always agree on one generation
    publisher_change: Mutex<()>,
    keyframe_pending: AtomicBool,
    feeder: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Lifecycle,
    counters: RouterCounters,
}

impl JobOwner for RouterShared {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl RouterShared {
    fn snapshot(&self) -> Arc<RouteTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copy-on-write update of the route table
    fn update<R>(&self, f: impl FnOnce(&mut RouteTable) -> R) -> R {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = RouteTable::clone(&table);
        let result = f(&mut next);
        *table = Arc::new(next);
        result
    }

    fn publisher_change(&self) -> MutexGuard<'_, ()> {
        self.publisher_change.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> MutexGuard<'_, TranscodeEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_feeder(&self, task: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.feeder.lock().unwrap_or_else(PoisonError::into_inner),
            task,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn start_feeder(self: &Arc<Self>, feed: PacketQueue<MediaPacket>, generation: u64) {
        let router = self.clone();
        let task = self.pools.io.spawn(async move {
            while let Some(packet) = feed.pop().await {
                router.deliver(packet, generation).await;
            }
            tracing::debug!(router = %router.id, generation, "publisher feed closed");
        });
        self.replace_feeder(Some(task));
    }

    async fn deliver(self: &Arc<Self>, packet: MediaPacket, generation: u64) {
        bump(&self.counters.packets_in);
        let table = self.snapshot();
        let Some(publisher) = table.publisher.as_ref().filter(|p| p.generation == generation) else {
            return;
        };
        let Some(source) = publisher
            .codecs
            .iter()
            .find(|c| c.payload_type == packet.payload_type())
            .cloned()
        else {
            let unknown = bump(&self.counters.unknown_payload_type);
            if unknown == 1 || unknown % 100 == 0 {
                tracing::debug!(router = %self.id, payload_type = packet.payload_type(), unknown, "packet with unknown payload type");
            }
            return;
        };

        let mut pending: Vec<(Arc<Subscription>, CodecParameters)> = Vec::new();
        for subscription in &table.subscriptions {
            if !subscription.is_live() {
                continue;
            }
            match subscription.route(source.payload_type) {
                Some(Route::Direct { payload_type }) => {
                    let out = if payload_type == packet.payload_type() {
                        packet.clone()
                    } else {
                        packet.with_payload_type(payload_type)
                    };
                    subscription.sink().deliver(out);
                    bump(&self.counters.relayed);
                }
                Some(Route::Transcode { target }) => pending.push((subscription.clone(), target)),
                Some(Route::Disabled) | None => {
                    bump(&self.counters.dropped_no_route);
                }
            }
        }
        drop(table);
        if pending.is_empty() {
            return;
        }

        let mut targets: Vec<CodecParameters> = Vec::new();
        for (_, target) in &pending {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }

        let job_packet = packet.clone();
        let job_source = source.clone();
        let result = self
            .pools
            .cpu
            .run_for(self.clone(), JobPriority::from(packet.kind()), move |router| {
                let mut engine = router.engine();
                engine.prepare(generation);
                if router.keyframe_pending.swap(false, Ordering::AcqRel) {
                    engine.force_keyframes();
                }
                engine.transcode(&job_source, &job_packet, &targets)
            })
            .await;

        let outputs = match result {
            Err(PoolError::OwnerClosed | PoolError::ShuttingDown) => return,
            Err(e) => {
                let dropped = bump(&self.counters.dropped_overload);
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(router = %self.id, error = %e, dropped, "transcode job dropped");
                }
                return;
            }
            Ok(Err(e)) if e.is_per_packet() => {
                bump(&self.counters.decodes);
                let errors = bump(&self.counters.codec_errors);
                if errors == 1 || errors % 100 == 0 {
                    tracing::debug!(router = %self.id, error = %e, errors, "dropping packet that failed to decode");
                }
                return;
            }
            Ok(Err(e)) => {
                for (subscription, _) in &pending {
                    if subscription.disable(source.payload_type) {
                        tracing::warn!(router = %self.id, subscriber = %subscription.id(), codec = %source.codec, error = %e, "route disabled");
                    }
                }
                return;
            }
            Ok(Ok(None)) => {
                bump(&self.counters.decodes);
                return;
            }
            Ok(Ok(Some(outputs))) => {
                bump(&self.counters.decodes);
                outputs
            }
        };

        // Publisher replaced while the job ran
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }

        for output in outputs {
            let subscribers = pending.iter().filter(|(_, target)| *target == output.target);
            match output.result {
                Ok(payloads) => {
                    bump(&self.counters.encodes);
                    if payloads.is_empty() {
                        continue;
                    }
                    for (subscription, target) in subscribers {
                        for out in subscription.stamp(&packet, source.clock_rate(), target, &payloads) {
                            subscription.sink().deliver(out);
                            bump(&self.counters.transcoded);
                        }
                    }
                }
                Err(e) if e.is_per_packet() => {
                    bump(&self.counters.encodes);
                    bump(&self.counters.codec_errors);
                    tracing::debug!(router = %self.id, target = %output.target.codec, error = %e, "encode failed");
                }
                Err(e) => {
                    for (subscription, _) in subscribers {
                        if subscription.disable(source.payload_type) {
                            tracing::warn!(router = %self.id, subscriber = %subscription.id(), codec = %output.target.codec, error = %e, "route disabled");
                        }
                    }
                }
            }
        }
    }

    /// Remove the publisher, keeping subscriptions. Returns the old one.
    /// `only` restricts removal to that connection being the publisher.
    fn take_publisher(&self, source_active: bool, only: Option<ConnectionId>) -> Option<Arc<Publisher>> {
        let _change = self.publisher_change();
        let previous = self.update(|table| {
            let current = table.publisher.as_ref()?.source.id();
            if only.is_some_and(|id| id != current) {
                return None;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            table.source_active = source_active;
            table.publisher.take()
        });
        if let Some(previous) = &previous {
            self.replace_feeder(None);
            previous.source.detach();
            previous.feed.close_and_clear();
        }
        previous
    }
}

/// Handle to a router; clones share the same router
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterShared>,
}

impl Router {
    pub fn new(id: RouterId, pools: Pools, codecs: Arc<dyn CodecFactory>, config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterShared {
                id,
                pools,
                config,
                table: RwLock::new(Arc::new(RouteTable::default())),
                engine: Mutex::new(TranscodeEngine::new(codecs)),
                generation: AtomicU64::new(0),
                publisher_change: Mutex::new(()),
                keyframe_pending: AtomicBool::new(false),
                feeder: Mutex::new(None),
                lifecycle: Lifecycle::new(),
                counters: RouterCounters::default(),
            }),
        }
    }

    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.lifecycle.is_closed() {
            return Err(RelayError::InvalidOperation(format!("router {} is closed", self.inner.id)));
        }
        Ok(())
    }

    pub fn publisher_id(&self) -> Option<ConnectionId> {
        self.inner.snapshot().publisher.as_ref().map(|p| p.source.id())
    }

    pub fn subscriber_ids(&self) -> Vec<ConnectionId> {
        self.inner
            .snapshot()
            .subscriptions
            .iter()
            .map(|s| s.id())
            .collect()
    }

    /// Whether a publisher is attached and its transport is healthy
    pub fn is_source_active(&self) -> bool {
        let table = self.inner.snapshot();
        table.source_active && table.publisher.is_some()
    }

    pub fn routes_for(&self, subscriber: ConnectionId) -> Option<std::collections::HashMap<u8, Route>> {
        self.inner
            .snapshot()
            .subscriptions
            .iter()
            .find(|s| s.id() == subscriber)
            .map(|s| s.routes())
    }

    /// Make `source` the publisher. Setting the current publisher again does
    /// nothing; a different one replaces it and resets all transcode state.
    pub fn set_publisher(&self, source: Arc<dyn MediaSource>) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        let source_id = source.id();
        let _change = inner.publisher_change();
        if self.publisher_id() == Some(source_id) {
            tracing::debug!(router = %inner.id, publisher = %source_id, "publisher already set");
            return Ok(());
        }

        let codecs = source.codecs();
        let feed = inner.pools.io.queue_with_capacity(inner.config.feed_queue_capacity);
        let (generation, previous) = inner.update(|table| {
            let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            for subscription in &table.subscriptions {
                subscription.reroute(&codecs);
            }
            table.source_active = true;
            let previous = table.publisher.replace(Arc::new(Publisher {
                source: source.clone(),
                codecs: codecs.clone(),
                feed: feed.clone(),
                generation,
            }));
            (generation, previous)
        });
        if let Some(previous) = previous {
            previous.source.detach();
            previous.feed.close_and_clear();
            tracing::info!(router = %inner.id, previous = %previous.source.id(), "publisher replaced");
        }

        source.attach(feed.clone());
        inner.start_feeder(feed, generation);
        source.request_keyframe();
        tracing::info!(router = %inner.id, publisher = %source_id, generation, "publisher set");
        Ok(())
    }

    /// Subscribe `sink`. A sink with the same id replaces its earlier
    /// subscription.
    pub fn add_subscriber(&self, sink: Arc<dyn MediaSink>) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        let id = sink.id();
        let (subscription, replaced, publisher) = inner.update(|table| {
            let codecs = table
                .publisher
                .as_ref()
                .map(|p| p.codecs.clone())
                .unwrap_or_default();
            let subscription = Arc::new(Subscription::new(sink, &codecs));
            let replaced = table
                .subscriptions
                .iter()
                .position(|s| s.id() == id)
                .map(|index| table.subscriptions.remove(index));
            table.subscriptions.push(subscription.clone());
            (subscription, replaced, table.publisher.clone())
        });
        if let Some(replaced) = replaced {
            replaced.retire();
        }
        tracing::info!(router = %inner.id, subscriber = %id, routes = ?subscription.routes(), "subscriber added");

        if let Some(publisher) = publisher {
            publisher.source.request_keyframe();
        }
        Ok(())
    }

    /// Remove a subscriber. Safe while packets are being delivered: a packet
    /// that already passed the liveness check may still arrive.
    pub fn remove_subscriber(&self, id: ConnectionId) -> bool {
        let removed = self.inner.update(|table| {
            table
                .subscriptions
                .iter()
                .position(|s| s.id() == id)
                .map(|index| table.subscriptions.remove(index))
        });
        match removed {
            Some(subscription) => {
                subscription.retire();
                tracing::info!(router = %self.inner.id, subscriber = %id, "subscriber removed");
                true
            }
            None => false,
        }
    }

    /// The publisher's transport failed: drop the publisher role but keep
    /// every subscription, marked as having no active source. Returns `false`
    /// if `connection_id` is not the current publisher.
    pub fn publisher_lost(&self, connection_id: ConnectionId) -> bool {
        if self.inner.take_publisher(false, Some(connection_id)).is_none() {
            return false;
        }
        tracing::warn!(router = %self.inner.id, publisher = %connection_id, "publisher lost, subscriptions kept");
        true
    }

    /// Forward a subscriber's keyframe request to the publisher
    pub fn request_keyframe(&self) {
        self.inner.keyframe_pending.store(true, Ordering::Release);
        if let Some(publisher) = &self.inner.snapshot().publisher {
            publisher.source.request_keyframe();
        }
    }

    /// Detach everything. Idempotent.
    pub fn close(&self) {
        if !self.inner.lifecycle.close() {
            return;
        }
        self.inner.take_publisher(false, None);
        let subscriptions = self.inner.update(|table| std::mem::take(&mut table.subscriptions));
        for subscription in &subscriptions {
            subscription.retire();
        }
        self.inner.engine().reset();
        tracing::info!(router = %self.inner.id, subscribers = subscriptions.len(), "router closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    pub fn stats(&self) -> RouterStats {
        let table = self.inner.snapshot();
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RouterStats {
            subscribers: table.subscriptions.len(),
            has_publisher: table.publisher.is_some(),
            packets_in: load(&c.packets_in),
            relayed: load(&c.relayed),
            transcoded: load(&c.transcoded),
            decodes: load(&c.decodes),
            encodes: load(&c.encodes),
            codec_errors: load(&c.codec_errors),
            unknown_payload_type: load(&c.unknown_payload_type),
            dropped_no_route: load(&c.dropped_no_route),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolsConfig;
    use fanout_media::CodecRegistry;
    use fanout_protocol::{Codec, MediaKind};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct RecordingSink {
        id: ConnectionId,
        codecs: Vec<CodecParameters>,
        packets: Mutex<Vec<MediaPacket>>,
    }

    impl RecordingSink {
        fn new(codecs: Vec<CodecParameters>) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new_v4(),
                codecs,
                packets: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<MediaPacket> {
            self.packets.lock().unwrap().clone()
        }
    }

    impl MediaSink for RecordingSink {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn codecs(&self) -> Vec<CodecParameters> {
            self.codecs.clone()
        }

        fn deliver(&self, packet: MediaPacket) {
            self.packets.lock().unwrap().push(packet);
        }
    }

    struct TestSource {
        id: ConnectionId,
        codecs: Vec<CodecParameters>,
        feed: Mutex<Option<PacketQueue<MediaPacket>>>,
        keyframe_requests: AtomicUsize,
    }

    impl TestSource {
        fn new(codecs: Vec<CodecParameters>) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new_v4(),
                codecs,
                feed: Mutex::new(None),
                keyframe_requests: AtomicUsize::new(0),
            })
        }

        fn push(&self, packet: MediaPacket) {
            if let Some(feed) = self.feed.lock().unwrap().as_ref() {
                feed.push(packet);
            }
        }
    }

    impl MediaSource for TestSource {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn codecs(&self) -> Vec<CodecParameters> {
            self.codecs.clone()
        }

        fn attach(&self, feed: PacketQueue<MediaPacket>) {
            *self.feed.lock().unwrap() = Some(feed);
        }

        fn detach(&self) {
            self.feed.lock().unwrap().take();
        }

        fn request_keyframe(&self) {
            self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn router() -> Router {
        let pools = Pools::with_io_handle(&PoolsConfig::default(), tokio::runtime::Handle::current());
        Router::new(
            RouterId::new_v4(),
            pools,
            Arc::new(CodecRegistry::new()),
            RouterConfig::default(),
        )
    }

    fn audio(pt: u8, seq: u16) -> MediaPacket {
        MediaPacket::builder(MediaKind::Audio)
            .ssrc(77)
            .sequence_number(seq)
            .timestamp(seq as u32 * 160)
            .payload_type(pt)
            .payload(vec![0xffu8; 160])
            .build()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn relays_in_order_with_payload_type_remap() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        let sink = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 100)]);
        router.set_publisher(source.clone()).unwrap();
        router.add_subscriber(sink.clone()).unwrap();

        for seq in 1..=50 {
            source.push(audio(0, seq));
        }
        wait_for(|| sink.received().len() == 50).await;

        let received = sink.received();
        let seqs: Vec<u16> = received.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
        assert!(received.iter().all(|p| p.payload_type() == 100 && p.ssrc() == 77));
        assert_eq!(router.stats().relayed, 50);
    }

    #[tokio::test]
    async fn set_publisher_is_idempotent_and_requests_keyframes() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        router.set_publisher(source.clone()).unwrap();
        assert_eq!(source.keyframe_requests.load(Ordering::SeqCst), 1);

        router
            .add_subscriber(RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]))
            .unwrap();
        assert_eq!(source.keyframe_requests.load(Ordering::SeqCst), 2);
        router.request_keyframe();
        assert_eq!(source.keyframe_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publisher_changes_leave_router_consistent() {
        let router = router();
        let sources: Vec<Arc<TestSource>> = (0..4)
            .map(|_| TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]))
            .collect();
        let sink = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.add_subscriber(sink.clone()).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let router = router.clone();
                let sources = sources.clone();
                tokio::task::spawn_blocking(move || {
                    for round in 0..50 {
                        let source = sources[(worker + round) % sources.len()].clone();
                        router.set_publisher(source).unwrap();
                        if round % 7 == 0 {
                            router.publisher_lost(sources[worker].id);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let publisher = sources[0].clone();
        router.set_publisher(publisher.clone()).unwrap();
        let attached: Vec<ConnectionId> = sources
            .iter()
            .filter(|s| s.feed.lock().unwrap().is_some())
            .map(|s| s.id)
            .collect();
        assert_eq!(attached, vec![publisher.id]);
        assert_eq!(router.publisher_id(), Some(publisher.id));

        let before = sink.received().len();
        for seq in 1..=20 {
            publisher.push(audio(0, seq));
        }
        wait_for(|| sink.received().len() >= before + 20).await;
        let tail: Vec<u16> = sink.received()[before..].iter().map(|p| p.sequence_number()).collect();
        assert_eq!(tail, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transcodes_once_per_target_codec() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        let pcma_a = RecordingSink::new(vec![CodecParameters::new(Codec::Pcma, 8)]);
        let pcma_b = RecordingSink::new(vec![CodecParameters::new(Codec::Pcma, 8)]);
        let direct = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        for sink in [&pcma_a, &pcma_b, &direct] {
            router.add_subscriber(sink.clone()).unwrap();
        }

        for seq in 1..=10 {
            source.push(audio(0, seq));
        }
        wait_for(|| pcma_a.received().len() == 10 && pcma_b.received().len() == 10).await;

        let stats = router.stats();
        assert_eq!(stats.decodes, 10);
        assert_eq!(stats.encodes, 10);
        assert_eq!(stats.transcoded, 20);
        assert_eq!(stats.relayed, 10);

        let a = pcma_a.received();
        let b = pcma_b.received();
        assert!(a.iter().all(|p| p.payload_type() == 8));
        // Each subscription has its own output stream
        assert_ne!(a[0].ssrc(), b[0].ssrc());
        for pair in a.windows(2) {
            assert_eq!(pair[1].sequence_number(), pair[0].sequence_number().wrapping_add(1));
        }
    }

    #[tokio::test]
    async fn unavailable_decoder_disables_route() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Vp8, 96)]);
        let vp9 = RecordingSink::new(vec![CodecParameters::new(Codec::Vp9, 98)]);
        let audio_only = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        router.add_subscriber(vp9.clone()).unwrap();
        router.add_subscriber(audio_only.clone()).unwrap();

        assert!(router.routes_for(audio_only.id).unwrap().is_empty());
        assert_eq!(
            router.routes_for(vp9.id).unwrap()[&96],
            Route::Transcode {
                target: CodecParameters::new(Codec::Vp9, 98)
            }
        );

        let frame = MediaPacket::builder(MediaKind::Video)
            .ssrc(9)
            .sequence_number(1)
            .payload_type(96)
            .payload(vec![0x10u8, 0x00, 0x9d])
            .build();
        source.push(frame.clone());
        wait_for(|| router.routes_for(vp9.id).unwrap()[&96] == Route::Disabled).await;

        source.push(frame);
        wait_for(|| router.stats().dropped_no_route >= 3).await;
        assert!(vp9.received().is_empty());
    }

    #[tokio::test]
    async fn publisher_lost_keeps_subscriptions() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        let sink = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        router.add_subscriber(sink.clone()).unwrap();
        assert!(router.is_source_active());

        assert!(!router.publisher_lost(ConnectionId::new_v4()));
        assert!(router.publisher_lost(source.id));
        assert!(!router.is_source_active());
        assert_eq!(router.subscriber_ids(), vec![sink.id]);
        assert!(source.feed.lock().unwrap().is_none());

        // A new publisher resumes delivery
        let replacement = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(replacement.clone()).unwrap();
        replacement.push(audio(0, 9));
        wait_for(|| sink.received().len() == 1).await;
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscription() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        let sink = RecordingSink::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.add_subscriber(sink.clone()).unwrap();
        router.add_subscriber(sink.clone()).unwrap();
        assert_eq!(router.subscriber_ids().len(), 1);

        source.push(audio(0, 1));
        wait_for(|| !sink.received().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.received().len(), 1);
    }

    #[tokio::test]
    async fn closed_router_rejects_changes() {
        let router = router();
        let source = TestSource::new(vec![CodecParameters::new(Codec::Pcmu, 0)]);
        router.set_publisher(source.clone()).unwrap();
        router.close();
        router.close();
        assert!(source.feed.lock().unwrap().is_none());
        assert!(matches!(
            router.set_publisher(source.clone()),
            Err(RelayError::InvalidOperation(_))
        ));
        assert!(!router.remove_subscriber(ConnectionId::new_v4()));
    }
}
