use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use fanout_media::MediaPacket;
use fanout_protocol::{Codec, CodecParameters, ConnectionId, MediaKind};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::FeedSlot;
use crate::config::SyntheticConfig;
use crate::pool::{IoPool, PacketQueue};

const MAX_RTP_PAYLOAD: usize = 1200;
const AUDIO_FRAME: Duration = Duration::from_millis(20);
/// Opus TOC for a 20ms CELT frame followed by a zero-length frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const MIN_FRAME_BYTES: usize = 32;

/// VP8 frame header (RFC 6386 section 9.1) padded to `size` bytes
pub(crate) fn vp8_frame(keyframe: bool, size: usize, width: u16, height: u16) -> Bytes {
    let header_len = if keyframe { 10 } else { 3 };
    let size = size.max(header_len + 1);
    let first_partition = ((size - header_len) as u32).min(0x7ffff);
    let tag = u32::from(!keyframe) | (1 << 4) | (first_partition << 5);

    let mut frame = BytesMut::with_capacity(size);
    frame.put_slice(&tag.to_le_bytes()[..3]);
    if keyframe {
        frame.put_slice(&[0x9d, 0x01, 0x2a]);
        frame.put_u16_le(width & 0x3fff);
        frame.put_u16_le(height & 0x3fff);
    }
    let mut filler: u8 = 0;
    while frame.len() < size {
        frame.put_u8(filler);
        filler = filler.wrapping_add(1);
    }
    frame.freeze()
}

/// Split a VP8 frame into RTP payloads (RFC 7741), marker on the last one
pub(crate) fn packetize_vp8(frame: &[u8]) -> Vec<(Bytes, bool)> {
    let chunk_size = MAX_RTP_PAYLOAD - 1;
    let count = frame.len().div_ceil(chunk_size);
    frame
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let mut payload = BytesMut::with_capacity(chunk.len() + 1);
            // S bit on the first packet of the partition
            payload.put_u8(if index == 0 { 0x10 } else { 0x00 });
            payload.put_slice(chunk);
            (payload.freeze(), index + 1 == count)
        })
        .collect()
}

fn silence(codec: Codec) -> Bytes {
    match codec {
        Codec::Pcmu => Bytes::from(vec![0xffu8; 160]),
        Codec::Pcma => Bytes::from(vec![0xd5u8; 160]),
        _ => Bytes::from_static(&OPUS_SILENCE),
    }
}

struct Track {
    kind: MediaKind,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
}

impl Track {
    fn new(kind: MediaKind, payload_type: u8) -> Self {
        Self {
            kind,
            payload_type,
            ssrc: rand::random(),
            sequence_number: rand::random::<u16>() & 0x7fff,
            timestamp: rand::random(),
        }
    }

    fn packet(&mut self, payload: Bytes, marker: bool) -> MediaPacket {
        let packet = MediaPacket::builder(self.kind)
            .ssrc(self.ssrc)
            .sequence_number(self.sequence_number)
            .timestamp(self.timestamp)
            .payload_type(self.payload_type)
            .marker(marker)
            .payload(payload)
            .build();
        self.sequence_number = self.sequence_number.wrapping_add(1);
        packet
    }
}

/// Generates VP8-shaped video and silent audio while attached to a router
pub struct SyntheticSource {
    id: ConnectionId,
    config: SyntheticConfig,
    io: Arc<IoPool>,
    slot: FeedSlot,
    generator: Mutex<Option<JoinHandle<()>>>,
    keyframe_requested: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl SyntheticSource {
    pub fn new(id: ConnectionId, config: SyntheticConfig, io: Arc<IoPool>) -> Self {
        tracing::info!(
            connection = %id,
            video = config.video,
            audio = config.audio,
            bitrate_kbps = config.video_bitrate_kbps,
            frame_rate = config.frame_rate,
            "synthetic source created"
        );
        Self {
            id,
            config,
            io,
            slot: FeedSlot::default(),
            generator: Mutex::new(None),
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn codecs(&self) -> &[CodecParameters] {
        &self.config.codecs
    }

    /// Video frames and audio packets generated so far
    pub fn frames_generated(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    pub fn attach(&self, feed: PacketQueue<MediaPacket>) {
        self.slot.set(Some(feed));
        let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
        if generator.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *generator = Some(self.io.spawn(generate(
            self.id,
            self.config.clone(),
            self.slot.clone(),
            self.keyframe_requested.clone(),
            self.frames.clone(),
        )));
    }

    pub fn detach(&self) {
        self.slot.set(None);
        if let Some(task) = self.generator.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn generate(
    id: ConnectionId,
    config: SyntheticConfig,
    slot: FeedSlot,
    keyframe_requested: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
) {
    let video_codec = config
        .codecs
        .iter()
        .find(|c| c.codec == Codec::Vp8)
        .filter(|_| config.video);
    if config.video && video_codec.is_none() {
        tracing::warn!(connection = %id, "synthetic video needs a VP8 codec, video disabled");
    }
    let audio_codec = config
        .codecs
        .iter()
        .find(|c| c.kind() == MediaKind::Audio)
        .filter(|_| config.audio);

    let mut video = video_codec.map(|c| Track::new(MediaKind::Video, c.payload_type));
    let mut audio = audio_codec.map(|c| (Track::new(MediaKind::Audio, c.payload_type), c.codec));
    if video.is_none() && audio.is_none() {
        tracing::warn!(connection = %id, "synthetic source has nothing to generate");
        return;
    }

    let frame_rate = config.frame_rate.max(1);
    let frame_bytes = ((config.video_bitrate_kbps as usize * 1000 / 8) / frame_rate as usize).max(MIN_FRAME_BYTES);
    let video_ts_step = Codec::Vp8.clock_rate() / frame_rate;
    let keyframe_interval = Duration::from_millis(config.keyframe_interval_ms);
    let mut last_keyframe: Option<Instant> = None;

    let mut video_tick = tokio::time::interval(Duration::from_secs(1) / frame_rate);
    video_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut audio_tick = tokio::time::interval(AUDIO_FRAME);
    audio_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = video_tick.tick(), if video.is_some() => {
                let Some(track) = video.as_mut() else { continue };
                let now = Instant::now();
                let requested = keyframe_requested.swap(false, Ordering::AcqRel);
                let keyframe = requested || last_keyframe.is_none_or(|at| now.duration_since(at) >= keyframe_interval);
                if keyframe {
                    last_keyframe = Some(now);
                    tracing::debug!(connection = %id, requested, "synthetic keyframe");
                }
                let size = if keyframe { frame_bytes * 3 } else { frame_bytes };
                let frame = vp8_frame(keyframe, size, config.width, config.height);
                for (payload, marker) in packetize_vp8(&frame) {
                    slot.push(track.packet(payload, marker));
                }
                track.timestamp = track.timestamp.wrapping_add(video_ts_step);
                frames.fetch_add(1, Ordering::Relaxed);
            }
            _ = audio_tick.tick(), if audio.is_some() => {
                let Some((track, codec)) = audio.as_mut() else { continue };
                slot.push(track.packet(silence(*codec), false));
                track.timestamp = track.timestamp.wrapping_add(codec.clock_rate() / 50);
                frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn is_keyframe(payload: &[u8]) -> bool {
        // Descriptor byte with S set, then the frame tag
        payload[0] & 0x10 != 0 && payload[1] & 0x01 == 0
    }

    #[test]
    fn keyframe_header_carries_dimensions() {
        let frame = vp8_frame(true, 100, 640, 480);
        assert_eq!(frame.len(), 100);
        assert_eq!(frame[0] & 0x01, 0);
        assert_eq!(&frame[3..6], &[0x9d, 0x01, 0x2a]);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), 640);
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 480);

        let inter = vp8_frame(false, 50, 640, 480);
        assert_eq!(inter[0] & 0x01, 1);
        assert_eq!(inter.len(), 50);
    }

    #[test]
    fn packetizes_with_start_bit_and_marker() {
        let frame = vp8_frame(true, 3000, 320, 240);
        let packets = packetize_vp8(&frame);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].0[0], 0x10);
        assert_eq!(packets[1].0[0], 0x00);
        assert!(!packets[0].1 && !packets[1].1 && packets[2].1);
        let total: usize = packets.iter().map(|(p, _)| p.len() - 1).sum();
        assert_eq!(total, 3000);
    }

    #[tokio::test]
    async fn generates_keyframes_and_audio_silence() {
        let io = Arc::new(IoPool::from_handle(tokio::runtime::Handle::current(), &PoolConfig::default()));
        let config = SyntheticConfig {
            frame_rate: 50,
            keyframe_interval_ms: 60_000,
            ..Default::default()
        };
        let source = SyntheticSource::new(ConnectionId::new_v4(), config, io.clone());
        let feed = io.queue();
        source.attach(feed.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut first_batch = Vec::new();
        while let Some(packet) = feed.try_pop() {
            first_batch.push(packet);
        }
        let video: Vec<_> = first_batch.iter().filter(|p| p.kind() == MediaKind::Video).collect();
        let audio: Vec<_> = first_batch.iter().filter(|p| p.kind() == MediaKind::Audio).collect();
        assert!(is_keyframe(video[0].payload()));
        assert!(!video.iter().skip(1).any(|p| is_keyframe(p.payload())));
        assert!(audio.len() >= 3);
        assert!(audio.iter().all(|p| p.payload().as_ref() == OPUS_SILENCE && p.payload_type() == 111));
        for pair in audio.windows(2) {
            assert_eq!(pair[1].timestamp().wrapping_sub(pair[0].timestamp()), 960);
        }

        source.request_keyframe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.detach();
        let mut requested = false;
        while let Some(packet) = feed.try_pop() {
            requested |= packet.kind() == MediaKind::Video && is_keyframe(packet.payload());
        }
        assert!(requested);
        assert!(source.frames_generated() > 0);
    }
}
