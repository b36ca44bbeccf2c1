use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fanout_media::MediaPacket;
use fanout_protocol::{CodecParameters, ConnectionId};
use tokio::fs::File;
use tokio::io::{BufReader, BufWriter};
use tokio::task::JoinHandle;

use super::FeedSlot;
use super::rtpdump::{RtpDumpHeader, RtpDumpReader, RtpDumpRecord, RtpDumpWriter};
use crate::pool::{IoPool, PacketQueue, PushOutcome};

const LOOP_GAP: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct LoopStream {
    round: u32,
    seq_shift: u16,
    ts_shift: u32,
    last_seq: u16,
    last_ts: u32,
}

/// Shifts sequence numbers and timestamps on every pass over a looping file
/// so each SSRC keeps counting up.
#[derive(Debug, Default)]
struct LoopContinuity {
    round: u32,
    streams: HashMap<u32, LoopStream>,
}

impl LoopContinuity {
    fn next_round(&mut self) {
        self.round += 1;
    }

    fn apply(&mut self, packet: MediaPacket, clock_rate: u32) -> MediaPacket {
        let round = self.round;
        let stream = self.streams.entry(packet.ssrc()).or_insert_with(|| LoopStream {
            round,
            ..Default::default()
        });
        if stream.round != round {
            stream.seq_shift = stream.last_seq.wrapping_add(1).wrapping_sub(packet.sequence_number());
            stream.ts_shift = stream
                .last_ts
                .wrapping_add(clock_rate / 50)
                .wrapping_sub(packet.timestamp());
            stream.round = round;
        }
        let seq = packet.sequence_number().wrapping_add(stream.seq_shift);
        let ts = packet.timestamp().wrapping_add(stream.ts_shift);
        stream.last_seq = seq;
        stream.last_ts = ts;
        if stream.seq_shift == 0 && stream.ts_shift == 0 {
            packet
        } else {
            packet.rewritten(packet.ssrc(), seq, ts)
        }
    }
}

/// Replays an rtpdump file at its recorded pace while attached to a router
pub struct FileSource {
    id: ConnectionId,
    path: PathBuf,
    looping: bool,
    codecs: Vec<CodecParameters>,
    io: Arc<IoPool>,
    slot: FeedSlot,
    player: Mutex<Option<JoinHandle<()>>>,
    /// Survives re-attachment so subscribers never see numbering restart
    continuity: Arc<Mutex<LoopContinuity>>,
    sent: Arc<AtomicU64>,
}

impl FileSource {
    /// Check that `path` is a readable rtpdump file. Playback starts when the
    /// source is attached.
    pub async fn open(
        id: ConnectionId,
        path: impl Into<PathBuf>,
        looping: bool,
        codecs: Vec<CodecParameters>,
        io: Arc<IoPool>,
    ) -> io::Result<Self> {
        let path = path.into();
        let reader = RtpDumpReader::new(BufReader::new(File::open(&path).await?)).await?;
        tracing::info!(
            connection = %id,
            path = %path.display(),
            recorded_from = %reader.header().source,
            looping,
            "file source opened"
        );
        Ok(Self {
            id,
            path,
            looping,
            codecs,
            io,
            slot: FeedSlot::default(),
            player: Mutex::new(None),
            continuity: Arc::new(Mutex::new(LoopContinuity::default())),
            sent: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn codecs(&self) -> &[CodecParameters] {
        &self.codecs
    }

    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Start (or keep) playing into `feed`
    pub fn attach(&self, feed: PacketQueue<MediaPacket>) {
        self.slot.set(Some(feed));
        let mut player = self.player.lock().unwrap_or_else(PoisonError::into_inner);
        if player.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let id = self.id;
        let path = self.path.clone();
        let looping = self.looping;
        let codecs = self.codecs.clone();
        let slot = self.slot.clone();
        let continuity = self.continuity.clone();
        let sent = self.sent.clone();
        *player = Some(self.io.spawn(async move {
            match play(id, &path, looping, &codecs, &slot, &continuity, &sent).await {
                Ok(()) => tracing::info!(connection = %id, sent = sent.load(Ordering::Relaxed), "file playback finished"),
                Err(e) => tracing::warn!(connection = %id, path = %path.display(), error = %e, "file playback failed"),
            }
        }));
    }

    pub fn detach(&self) {
        self.slot.set(None);
        if let Some(task) = self.player.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.slot.is_attached()
            && self
                .player
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }
}

async fn play(
    id: ConnectionId,
    path: &Path,
    looping: bool,
    codecs: &[CodecParameters],
    slot: &FeedSlot,
    continuity: &Mutex<LoopContinuity>,
    sent: &AtomicU64,
) -> io::Result<()> {
    let lock_continuity = || continuity.lock().unwrap_or_else(PoisonError::into_inner);
    // A replay after re-attachment continues where the last one stopped
    lock_continuity().next_round();
    let mut skipped = 0u64;
    loop {
        let mut reader = RtpDumpReader::new(BufReader::new(File::open(path).await?)).await?;
        let start = tokio::time::Instant::now();
        let mut played = 0u64;
        let mut last_offset = Duration::ZERO;

        while let Some(record) = reader.next_record().await? {
            if record.is_rtcp {
                continue;
            }
            let codec = MediaPacket::peek_payload_type(&record.data)
                .and_then(|pt| codecs.iter().find(|c| c.payload_type == pt));
            let Some(codec) = codec else {
                skipped += 1;
                if skipped == 1 || skipped % 100 == 0 {
                    tracing::debug!(connection = %id, skipped, "skipping record with unknown payload type");
                }
                continue;
            };

            tokio::time::sleep_until(start + record.offset).await;
            last_offset = record.offset;
            let packet = match MediaPacket::parse(&record.data, codec.kind(), Instant::now()) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(connection = %id, error = %e, "skipping malformed record");
                    continue;
                }
            };
            played += 1;
            let packet = lock_continuity().apply(packet, codec.clock_rate());
            if slot.push(packet) {
                sent.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !looping {
            return Ok(());
        }
        if played == 0 {
            tracing::warn!(connection = %id, "no playable packets in file, not looping");
            return Ok(());
        }
        // One frame interval between the last packet and the restart
        tokio::time::sleep_until(start + last_offset + LOOP_GAP).await;
        lock_continuity().next_round();
        tracing::debug!(connection = %id, played, "restarting file playback");
    }
}

/// Records every delivered packet to an rtpdump file
pub struct FileSink {
    id: ConnectionId,
    codecs: Vec<CodecParameters>,
    queue: PacketQueue<MediaPacket>,
    writer: Mutex<Option<JoinHandle<io::Result<u64>>>>,
    written: Arc<AtomicU64>,
}

impl FileSink {
    pub async fn create(
        id: ConnectionId,
        path: impl Into<PathBuf>,
        codecs: Vec<CodecParameters>,
        io: &IoPool,
    ) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path).await?;
        let writer = RtpDumpWriter::new(BufWriter::new(file), &RtpDumpHeader::default()).await?;
        let queue = io.queue();
        let written = Arc::new(AtomicU64::new(0));

        let task = {
            let queue = queue.clone();
            let written = written.clone();
            io.spawn(async move {
                let result = record(writer, &queue, &written).await;
                match &result {
                    Ok(records) => tracing::info!(connection = %id, records, "recording finished"),
                    Err(e) => {
                        queue.close_and_clear();
                        tracing::warn!(connection = %id, error = %e, "recording failed");
                    }
                }
                result
            })
        };
        tracing::info!(connection = %id, path = %path.display(), "file sink created");

        Ok(Self {
            id,
            codecs,
            queue,
            writer: Mutex::new(Some(task)),
            written,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn codecs(&self) -> &[CodecParameters] {
        &self.codecs
    }

    pub fn deliver(&self, packet: MediaPacket) -> PushOutcome {
        self.queue.push(packet)
    }

    pub fn packets_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stop accepting packets; queued ones are still written
    pub fn close(&self) {
        self.queue.close();
    }

    /// Close and wait until everything queued is on disk. Returns the number
    /// of records written.
    pub async fn finish(&self) -> io::Result<u64> {
        self.close();
        let task = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        match task {
            Some(task) => task.await.map_err(io::Error::other)?,
            None => Ok(self.packets_written()),
        }
    }
}

async fn record<W>(
    mut writer: RtpDumpWriter<W>,
    queue: &PacketQueue<MediaPacket>,
    written: &AtomicU64,
) -> io::Result<u64>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let start = Instant::now();
    while let Some(packet) = queue.pop().await {
        let data = match packet.marshal() {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "cannot serialise packet for recording");
                continue;
            }
        };
        writer
            .write_record(&RtpDumpRecord {
                offset: packet.arrival().saturating_duration_since(start),
                data,
                is_rtcp: false,
            })
            .await?;
        written.fetch_add(1, Ordering::Relaxed);
        if queue.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    Ok(writer.records())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use fanout_protocol::{Codec, MediaKind};

    fn pcmu(seq: u16) -> MediaPacket {
        MediaPacket::builder(MediaKind::Audio)
            .ssrc(1234)
            .sequence_number(seq)
            .timestamp(seq as u32 * 160)
            .payload_type(0)
            .payload(vec![0xffu8; 160])
            .build()
    }

    fn io_pool() -> Arc<IoPool> {
        Arc::new(IoPool::from_handle(tokio::runtime::Handle::current(), &PoolConfig::default()))
    }

    #[tokio::test]
    async fn sink_records_and_source_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.rtpdump");
        let io = io_pool();
        let codecs = vec![CodecParameters::new(Codec::Pcmu, 0)];

        let sink = FileSink::create(ConnectionId::new_v4(), &path, codecs.clone(), &io)
            .await
            .unwrap();
        for seq in 1..=5 {
            assert_eq!(sink.deliver(pcmu(seq)), PushOutcome::Queued);
        }
        assert_eq!(sink.finish().await.unwrap(), 5);
        assert_eq!(sink.deliver(pcmu(6)), PushOutcome::Closed);

        let source = FileSource::open(ConnectionId::new_v4(), &path, false, codecs, io.clone())
            .await
            .unwrap();
        let feed = io.queue();
        source.attach(feed.clone());

        let mut seqs = Vec::new();
        while seqs.len() < 5 {
            let packet = tokio::time::timeout(Duration::from_secs(2), feed.pop())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet.ssrc(), 1234);
            seqs.push(packet.sequence_number());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn looping_source_keeps_sequence_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.rtpdump");
        let io = io_pool();
        let codecs = vec![CodecParameters::new(Codec::Pcmu, 0)];

        let mut out = Vec::new();
        let mut writer = RtpDumpWriter::new(&mut out, &RtpDumpHeader::default()).await.unwrap();
        for (index, seq) in (100..103).enumerate() {
            writer
                .write_record(&RtpDumpRecord {
                    offset: Duration::from_millis(index as u64 * 20),
                    data: pcmu(seq).marshal().unwrap(),
                    is_rtcp: false,
                })
                .await
                .unwrap();
        }
        std::fs::write(&path, &out).unwrap();

        let source = FileSource::open(ConnectionId::new_v4(), &path, true, codecs, io.clone())
            .await
            .unwrap();
        let feed = io.queue();
        source.attach(feed.clone());

        let mut packets = Vec::new();
        while packets.len() < 7 {
            let packet = tokio::time::timeout(Duration::from_secs(2), feed.pop())
                .await
                .unwrap()
                .unwrap();
            packets.push(packet);
        }
        source.detach();

        let seqs: Vec<u16> = packets.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(seqs, vec![100, 101, 102, 103, 104, 105, 106]);
        assert_eq!(packets[3].timestamp(), packets[2].timestamp() + 160);
        assert!(!source.is_playing());
    }

    #[tokio::test]
    async fn reattached_source_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.rtpdump");
        let io = io_pool();
        let codecs = vec![CodecParameters::new(Codec::Pcmu, 0)];

        let sink = FileSink::create(ConnectionId::new_v4(), &path, codecs.clone(), &io)
            .await
            .unwrap();
        for seq in 500..503 {
            sink.deliver(pcmu(seq));
        }
        assert_eq!(sink.finish().await.unwrap(), 3);

        let source = FileSource::open(ConnectionId::new_v4(), &path, false, codecs, io.clone())
            .await
            .unwrap();
        let mut packets = Vec::new();
        for _ in 0..2 {
            let feed = io.queue();
            source.attach(feed.clone());
            for _ in 0..3 {
                let packet = tokio::time::timeout(Duration::from_secs(2), feed.pop())
                    .await
                    .unwrap()
                    .unwrap();
                packets.push(packet);
            }
            source.detach();
        }

        let seqs: Vec<u16> = packets.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(seqs, vec![500, 501, 502, 503, 504, 505]);
        assert!(packets.windows(2).all(|w| w[1].timestamp() > w[0].timestamp()));
        assert!(packets.iter().all(|p| p.ssrc() == 1234));
    }

    #[tokio::test]
    async fn open_rejects_missing_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let io = io_pool();
        let missing = FileSource::open(ConnectionId::new_v4(), dir.path().join("none"), false, vec![], io.clone()).await;
        assert_eq!(missing.err().unwrap().kind(), io::ErrorKind::NotFound);

        let foreign = dir.path().join("foreign.txt");
        std::fs::write(&foreign, "hello\nworld, this is not a capture").unwrap();
        let err = FileSource::open(ConnectionId::new_v4(), &foreign, false, vec![], io).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn continuity_shifts_later_rounds() {
        let mut continuity = LoopContinuity::default();
        let first = continuity.apply(pcmu(10), 8_000);
        assert_eq!(first.sequence_number(), 10);
        continuity.apply(pcmu(11), 8_000);
        continuity.next_round();
        let wrapped = continuity.apply(pcmu(10), 8_000);
        assert_eq!(wrapped.sequence_number(), 12);
        assert_eq!(wrapped.timestamp(), 11 * 160 + 160);
    }
}
