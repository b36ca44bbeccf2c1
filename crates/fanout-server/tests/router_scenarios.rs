//! Fan-out scenarios through the relay facade with external endpoints
//!
//! Run with: cargo test -p fanout-server --test router_scenarios

use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use fanout_media::{
    CodecError, CodecFactory, CodecRegistry, DecodedFrame, Decoder, EncodedPayload, Encoder, MediaPacket,
    VideoFrame,
};
use fanout_protocol::{Codec, CodecParameters, ConnectionId, MediaKind, RouterId};
use fanout_server::config::{PoolsConfig, RelayConfig, RouterConfig, SyntheticConfig};
use fanout_server::endpoint::rtpdump::{RtpDumpHeader, RtpDumpReader, RtpDumpRecord, RtpDumpWriter};
use fanout_server::pool::{PacketQueue, Pools};
use fanout_server::router::{MediaSink, MediaSource, Router};
use fanout_server::transport::WebRtcDtlsEngine;
use fanout_server::{ConnectionKind, Relay};
use tokio::io::BufReader;
use tokio::time::timeout;

/// VP8 in, H.264 out, with no real codec behind either
struct StandInVideo;

struct Vp8Reassembler {
    keyframe: Option<bool>,
}

impl Decoder for Vp8Reassembler {
    fn codec(&self) -> Codec {
        Codec::Vp8
    }

    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>, CodecError> {
        let payload = packet.payload();
        if payload.len() < 2 {
            return Err(CodecError::Decode("short VP8 payload".into()));
        }
        if payload[0] & 0x10 != 0 {
            self.keyframe = Some(payload[1] & 0x01 == 0);
        }
        if !packet.marker() {
            return Ok(None);
        }
        let Some(keyframe) = self.keyframe.take() else {
            return Ok(None);
        };
        Ok(Some(DecodedFrame::Video(VideoFrame {
            width: 320,
            height: 240,
            data: Bytes::from_static(&[0u8; 16]),
            keyframe,
        })))
    }
}

struct H264Stub {
    force_idr: bool,
}

impl Encoder for H264Stub {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn encode(&mut self, frame: &DecodedFrame) -> Result<Vec<EncodedPayload>, CodecError> {
        let DecodedFrame::Video(frame) = frame else {
            return Err(CodecError::Incompatible {
                from: Codec::Opus,
                to: Codec::H264,
            });
        };
        let idr = std::mem::take(&mut self.force_idr) || frame.keyframe;
        // NAL header: type 5 (IDR) or 1 (non-IDR slice)
        let nal = if idr { 0x65 } else { 0x41 };
        Ok(vec![EncodedPayload {
            payload: Bytes::from(vec![nal, 0x88, 0x84, 0x00]),
            marker: true,
        }])
    }

    fn force_keyframe(&mut self) {
        self.force_idr = true;
    }
}

impl CodecFactory for StandInVideo {
    fn decoder(&self, params: &CodecParameters) -> Result<Box<dyn Decoder>, CodecError> {
        match params.codec {
            Codec::Vp8 => Ok(Box::new(Vp8Reassembler { keyframe: None })),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    fn encoder(&self, params: &CodecParameters) -> Result<Box<dyn Encoder>, CodecError> {
        match params.codec {
            Codec::H264 => Ok(Box::new(H264Stub { force_idr: true })),
            other => Err(CodecError::Unsupported(other)),
        }
    }
}

async fn start_relay(codecs: CodecRegistry) -> Relay {
    let mut config = RelayConfig::default();
    config.pools.cpu.workers = 2;
    let pools = Pools::with_io_handle(&config.pools, tokio::runtime::Handle::current());
    let dtls = WebRtcDtlsEngine::generate(&pools.cpu)
        .await
        .expect("Failed to generate certificate");
    Relay::builder(config)
        .pools(pools)
        .codec_factory(Arc::new(codecs))
        .dtls_engine(Arc::new(dtls))
        .build()
        .await
        .expect("Failed to start relay")
}

/// (payload type, sequence number, ssrc, payload) of every RTP record
async fn read_recording(path: &Path) -> Vec<(u8, u16, u32, Bytes)> {
    let file = tokio::fs::File::open(path).await.unwrap();
    let mut reader = RtpDumpReader::new(BufReader::new(file)).await.unwrap();
    let mut packets = Vec::new();
    while let Some(record) = reader.next_record().await.unwrap() {
        if record.is_rtcp {
            continue;
        }
        let data = record.data;
        packets.push((
            data[1] & 0x7f,
            u16::from_be_bytes([data[2], data[3]]),
            u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data.slice(12..),
        ));
    }
    packets
}

async fn wait_for_packets(relay: &Relay, router: RouterId, count: u64) {
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if relay.router_stats(router).await.unwrap().packets_in >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "router never saw {count} packets");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_vp8_publisher_fans_out_to_vp8_and_h264() {
    let relay = start_relay(CodecRegistry::new().with_factory(Arc::new(StandInVideo))).await;
    let dir = tempfile::tempdir().unwrap();

    let source = relay
        .create_synthetic_source(SyntheticConfig {
            video: true,
            audio: false,
            frame_rate: 25,
            video_bitrate_kbps: 100,
            codecs: vec![CodecParameters::new(Codec::Vp8, 96)],
            ..Default::default()
        })
        .await;
    let h264 = vec![CodecParameters::new(Codec::H264, 102)];
    let first = relay.create_file_sink(dir.path().join("h264-a.rtpdump"), h264.clone()).await.unwrap();
    let second = relay.create_file_sink(dir.path().join("h264-b.rtpdump"), h264).await.unwrap();
    let direct = relay
        .create_file_sink(
            dir.path().join("vp8.rtpdump"),
            vec![CodecParameters::new(Codec::Vp8, 100)],
        )
        .await
        .unwrap();

    let router = relay.create_router().await;
    relay.add_subscriber(router, first).await.unwrap();
    relay.add_subscriber(router, second).await.unwrap();
    relay.add_subscriber(router, direct).await.unwrap();
    relay.set_publisher(router, source).await.unwrap();

    wait_for_packets(&relay, router, 15).await;
    relay.close(source).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = relay.router_stats(router).await.unwrap();
    assert!(!stats.has_publisher);
    assert_eq!(stats.subscribers, 3);
    assert!(stats.encodes > 0);
    // Two subscribers share one H.264 encode per frame
    assert_eq!(stats.transcoded, 2 * stats.encodes);
    // At most one decode per packet, whatever the number of H.264 subscribers
    assert!(stats.decodes <= stats.relayed);
    assert!(stats.encodes <= stats.decodes);
    assert_eq!(stats.codec_errors, 0);

    let first_count = relay.finish_recording(first).await.unwrap();
    let second_count = relay.finish_recording(second).await.unwrap();
    let direct_count = relay.finish_recording(direct).await.unwrap();
    assert_eq!(first_count, stats.encodes);
    assert_eq!(second_count, stats.encodes);
    assert_eq!(direct_count, stats.relayed);

    for name in ["h264-a.rtpdump", "h264-b.rtpdump"] {
        let packets = read_recording(&dir.path().join(name)).await;
        assert!(packets.iter().all(|(pt, ..)| *pt == 102));
        assert_eq!(packets[0].3[0], 0x65, "{name} must start with an IDR");
        assert!(packets.iter().all(|(_, _, ssrc, _)| *ssrc == packets[0].2));
        for pair in packets.windows(2) {
            assert_eq!(pair[1].1, pair[0].1.wrapping_add(1));
        }
    }
    let vp8 = read_recording(&dir.path().join("vp8.rtpdump")).await;
    assert!(vp8.iter().all(|(pt, ..)| *pt == 100));
    assert!(vp8.iter().all(|(_, _, ssrc, _)| *ssrc == vp8[0].2));
    for pair in vp8.windows(2) {
        assert_eq!(pair[1].1, pair[0].1.wrapping_add(1));
    }
    // First relayed packet opens a keyframe
    assert_eq!(vp8[0].3[0] & 0x10, 0x10);
    assert_eq!(vp8[0].3[1] & 0x01, 0);

    relay.shutdown().await;
}

/// Two packets per frame, the first frame a keyframe
fn vp8_packets(frames: u16) -> Vec<MediaPacket> {
    (0..frames * 2)
        .map(|index| {
            let frame = index / 2;
            let starts_frame = index % 2 == 0;
            let mut payload = vec![if starts_frame { 0x10 } else { 0x00 }];
            payload.push(if frame == 0 { 0x00 } else { 0x01 });
            payload.extend((0..40).map(|byte| (index as u8).wrapping_mul(31).wrapping_add(byte)));
            MediaPacket::builder(MediaKind::Video)
                .ssrc(0x0bad_cafe)
                .sequence_number(4000 + index)
                .timestamp(u32::from(frame) * 3600)
                .payload_type(96)
                .marker(!starts_frame)
                .payload(payload)
                .build()
        })
        .collect()
}

async fn write_file(path: &Path, packets: &[MediaPacket]) {
    let file = tokio::fs::File::create(path).await.unwrap();
    let header = RtpDumpHeader::new(SocketAddrV4::new([127, 0, 0, 1].into(), 5004));
    let mut writer = RtpDumpWriter::new(file, &header).await.unwrap();
    for (index, packet) in packets.iter().enumerate() {
        let record = RtpDumpRecord {
            offset: Duration::from_millis(index as u64 * 10),
            data: packet.marshal().unwrap(),
            is_rtcp: false,
        };
        writer.write_record(&record).await.unwrap();
    }
    writer.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_codec_subscriber_gets_publisher_packets_unchanged() {
    let relay = start_relay(CodecRegistry::new().with_factory(Arc::new(StandInVideo))).await;
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("vp8-input.rtpdump");
    let sent = vp8_packets(6);
    write_file(&input, &sent).await;

    let source = relay
        .create_file_source(&input, false, vec![CodecParameters::new(Codec::Vp8, 96)])
        .await
        .unwrap();
    let direct = relay
        .create_file_sink(dir.path().join("vp8.rtpdump"), vec![CodecParameters::new(Codec::Vp8, 100)])
        .await
        .unwrap();
    let transcoded = relay
        .create_file_sink(dir.path().join("h264.rtpdump"), vec![CodecParameters::new(Codec::H264, 102)])
        .await
        .unwrap();

    let router = relay.create_router().await;
    relay.add_subscriber(router, direct).await.unwrap();
    relay.add_subscriber(router, transcoded).await.unwrap();
    relay.set_publisher(router, source).await.unwrap();
    wait_for_packets(&relay, router, sent.len() as u64).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = relay.router_stats(router).await.unwrap();
    assert_eq!(stats.relayed, sent.len() as u64);
    assert_eq!(relay.finish_recording(direct).await.unwrap(), sent.len() as u64);
    assert_eq!(relay.finish_recording(transcoded).await.unwrap(), stats.encodes);

    let received = read_recording(&dir.path().join("vp8.rtpdump")).await;
    assert_eq!(received.len(), sent.len());
    for ((pt, seq, ssrc, payload), original) in received.iter().zip(&sent) {
        assert_eq!(*pt, 100);
        assert_eq!(*seq, original.sequence_number());
        assert_eq!(*ssrc, original.ssrc());
        assert_eq!(payload, original.payload());
    }
    for pair in received.windows(2) {
        assert_eq!(pair[1].1, pair[0].1.wrapping_add(1));
    }

    relay.shutdown().await;
}

async fn write_pcmu_file(path: &Path, packets: u16) {
    let packets: Vec<MediaPacket> = (0..packets)
        .map(|index| {
            MediaPacket::builder(MediaKind::Audio)
                .ssrc(0x1234_5678)
                .sequence_number(1000 + index)
                .timestamp(u32::from(index) * 160)
                .payload_type(0)
                .payload(vec![0xffu8; 160])
                .build()
        })
        .collect();
    write_file(path, &packets).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_source_records_direct_and_transcoded() {
    let relay = start_relay(CodecRegistry::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.rtpdump");
    write_pcmu_file(&input, 10).await;

    let source = relay
        .create_file_source(&input, false, vec![CodecParameters::new(Codec::Pcmu, 0)])
        .await
        .unwrap();
    assert_eq!(relay.connection_kind(source).await.unwrap(), ConnectionKind::FileSource);
    let same = relay
        .create_file_sink(dir.path().join("pcmu.rtpdump"), vec![CodecParameters::new(Codec::Pcmu, 0)])
        .await
        .unwrap();
    let alaw = relay
        .create_file_sink(dir.path().join("pcma.rtpdump"), vec![CodecParameters::new(Codec::Pcma, 8)])
        .await
        .unwrap();

    let router = relay.create_router().await;
    relay.add_subscriber(router, same).await.unwrap();
    relay.add_subscriber(router, alaw).await.unwrap();
    relay.set_publisher(router, source).await.unwrap();

    wait_for_packets(&relay, router, 10).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(relay.finish_recording(same).await.unwrap(), 10);
    assert_eq!(relay.finish_recording(alaw).await.unwrap(), 10);

    let direct = read_recording(&dir.path().join("pcmu.rtpdump")).await;
    let sequences: Vec<u16> = direct.iter().map(|(_, seq, ..)| *seq).collect();
    assert_eq!(sequences, (1000..1010).collect::<Vec<_>>());
    assert!(direct.iter().all(|(pt, _, ssrc, _)| *pt == 0 && *ssrc == 0x1234_5678));

    // Mu-law silence decodes to zero, which is 0xd5 in A-law
    let transcoded = read_recording(&dir.path().join("pcma.rtpdump")).await;
    assert!(transcoded.iter().all(|(pt, ..)| *pt == 8));
    assert!(transcoded.iter().all(|(.., payload)| payload.len() == 160 && payload.iter().all(|b| *b == 0xd5)));
    assert!(transcoded.iter().all(|(_, _, ssrc, _)| *ssrc != 0x1234_5678));
    for pair in transcoded.windows(2) {
        assert_eq!(pair[1].1, pair[0].1.wrapping_add(1));
    }

    relay.close(source).await.unwrap();
    relay.close(same).await.unwrap();
    relay.close(alaw).await.unwrap();
    assert!(relay.connection_ids().await.is_empty());
    assert!(relay.close(source).await.is_err());
    relay.close_router(router).await.unwrap();
    assert!(relay.router_ids().await.is_empty());
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sinks_cannot_publish_and_sources_cannot_subscribe() {
    let relay = start_relay(CodecRegistry::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let codecs = vec![CodecParameters::new(Codec::Pcmu, 0)];

    let sink = relay.create_file_sink(dir.path().join("out.rtpdump"), codecs.clone()).await.unwrap();
    let source = relay
        .create_synthetic_source(SyntheticConfig {
            video: false,
            codecs,
            ..Default::default()
        })
        .await;
    let router = relay.create_router().await;
    let other = relay.create_router().await;

    assert!(relay.set_publisher(router, sink).await.is_err());
    assert!(relay.add_subscriber(router, source).await.is_err());

    relay.set_publisher(router, source).await.unwrap();
    // Publishing again into the same router is a no-op
    relay.set_publisher(router, source).await.unwrap();
    assert!(relay.set_publisher(other, source).await.is_err());

    assert!(relay.add_remote_candidate(source, "candidate:1 1 udp 1 127.0.0.1 9 typ host").await.is_err());
    assert!(relay.open(sink).await.is_err());
    assert!(!relay.remove_subscriber(router, sink).await.unwrap());

    relay.shutdown().await;
    assert!(relay.connection_ids().await.is_empty());
}

/// Counts packets that arrive after it was unsubscribed
struct WatchedSink {
    id: ConnectionId,
    removed: AtomicBool,
    received: AtomicU64,
    after_removal: AtomicU64,
}

impl WatchedSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new_v4(),
            removed: AtomicBool::new(false),
            received: AtomicU64::new(0),
            after_removal: AtomicU64::new(0),
        })
    }
}

impl MediaSink for WatchedSink {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn codecs(&self) -> Vec<CodecParameters> {
        vec![CodecParameters::new(Codec::Opus, 111)]
    }

    fn deliver(&self, _packet: MediaPacket) {
        self.received.fetch_add(1, Ordering::SeqCst);
        if self.removed.load(Ordering::SeqCst) {
            self.after_removal.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct PumpSource {
    id: ConnectionId,
    feed: Mutex<Option<PacketQueue<MediaPacket>>>,
}

impl MediaSource for PumpSource {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn codecs(&self) -> Vec<CodecParameters> {
        vec![CodecParameters::new(Codec::Opus, 111)]
    }

    fn attach(&self, feed: PacketQueue<MediaPacket>) {
        *self.feed.lock().unwrap() = Some(feed);
    }

    fn detach(&self) {
        self.feed.lock().unwrap().take();
    }

    fn request_keyframe(&self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribe_races_with_delivery() {
    let pools = Pools::with_io_handle(&PoolsConfig::default(), tokio::runtime::Handle::current());
    let router = Router::new(
        ConnectionId::new_v4(),
        pools,
        Arc::new(CodecRegistry::new()),
        RouterConfig::default(),
    );
    let source = Arc::new(PumpSource {
        id: ConnectionId::new_v4(),
        feed: Mutex::new(None),
    });
    router.set_publisher(source.clone()).unwrap();
    let sinks: Vec<Arc<WatchedSink>> = (0..16).map(|_| WatchedSink::new()).collect();
    for sink in &sinks {
        router.add_subscriber(sink.clone()).unwrap();
    }

    let pump = {
        let source = source.clone();
        tokio::spawn(async move {
            for seq in 0..2000u16 {
                let packet = MediaPacket::builder(MediaKind::Audio)
                    .ssrc(7)
                    .sequence_number(seq)
                    .timestamp(u32::from(seq) * 960)
                    .payload_type(111)
                    .payload(vec![0xf8, 0xff, 0xfe])
                    .build();
                if let Some(feed) = source.feed.lock().unwrap().as_ref() {
                    feed.push(packet);
                }
                if seq % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let remover = {
        let router = router.clone();
        let sinks = sinks.clone();
        tokio::spawn(async move {
            for sink in sinks.iter().step_by(2) {
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert!(router.remove_subscriber(sink.id));
                sink.removed.store(true, Ordering::SeqCst);
            }
        })
    };

    pump.await.unwrap();
    remover.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (index, sink) in sinks.iter().enumerate() {
        if index % 2 == 0 {
            assert!(sink.after_removal.load(Ordering::SeqCst) <= 1, "sink {index} kept receiving");
        } else {
            assert!(sink.received.load(Ordering::SeqCst) > 0);
        }
    }
    assert_eq!(router.subscriber_ids().len(), 8);
    router.close();
    assert!(router.is_closed());
}
