//! Inbound reordering buffer
//!
//! Packets are released in sequence order. A gap is waited on until either the
//! buffer holds `capacity` packets or the oldest held packet is older than
//! `max_delay`, then it is skipped and counted as lost. Packets older than the
//! release point (late or duplicate) are dropped.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use fanout_protocol::PipelineStats;

use crate::packet::MediaPacket;
use crate::transform::PacketTransform;

/// Extends 16-bit RTP sequence numbers to a monotonic 64-bit space
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    highest: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let Some(highest) = self.highest else {
            self.highest = Some(seq as i64);
            return seq as i64;
        };
        let delta = seq.wrapping_sub(highest as u16) as i16 as i64;
        let extended = highest + delta;
        if extended > highest {
            self.highest = Some(extended);
        }
        extended
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub capacity: usize,
    pub max_delay: Duration,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct StreamBuffer {
    unwrapper: SequenceUnwrapper,
    next: Option<i64>,
    pending: BTreeMap<i64, MediaPacket>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitterStats {
    pub reordered: u64,
    pub late_dropped: u64,
    pub lost: u64,
}

/// Reorders each SSRC independently
#[derive(Debug, Default)]
pub struct JitterBuffer {
    config: JitterConfig,
    streams: HashMap<u32, StreamBuffer>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            stats: JitterStats::default(),
        }
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    fn drain_ready(stream: &mut StreamBuffer, out: &mut Vec<MediaPacket>) {
        let Some(mut next) = stream.next else { return };
        while let Some(packet) = stream.pending.remove(&next) {
            out.push(packet);
            next += 1;
        }
        stream.next = Some(next);
    }

    /// Jump the release point to the oldest held packet
    fn skip_gap(stream: &mut StreamBuffer, stats: &mut JitterStats, out: &mut Vec<MediaPacket>) {
        let (Some(next), Some(&first)) = (stream.next, stream.pending.keys().next()) else {
            return;
        };
        stats.lost += (first - next).max(0) as u64;
        stream.next = Some(first);
        Self::drain_ready(stream, out);
    }
}

impl PacketTransform for JitterBuffer {
    fn name(&self) -> &'static str {
        "jitter_buffer"
    }

    fn process(&mut self, packet: MediaPacket, out: &mut Vec<MediaPacket>) {
        let config = self.config;
        let stream = self.streams.entry(packet.ssrc()).or_default();
        let extended = stream.unwrapper.unwrap(packet.sequence_number());
        let next = *stream.next.get_or_insert(extended);

        if extended < next || stream.pending.contains_key(&extended) {
            self.stats.late_dropped += 1;
            tracing::debug!(
                ssrc = packet.ssrc(),
                seq = packet.sequence_number(),
                "dropping late or duplicate packet"
            );
            return;
        }

        if extended == next {
            out.push(packet);
            stream.next = Some(next + 1);
            Self::drain_ready(stream, out);
            return;
        }

        let now = packet.arrival();
        self.stats.reordered += 1;
        stream.pending.insert(extended, packet);

        loop {
            let oldest_expired = stream
                .pending
                .values()
                .next()
                .is_some_and(|oldest| now.saturating_duration_since(oldest.arrival()) >= config.max_delay);
            if stream.pending.len() <= config.capacity && !oldest_expired {
                break;
            }
            Self::skip_gap(stream, &mut self.stats, out);
            if stream.pending.is_empty() {
                break;
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<MediaPacket>) {
        for stream in self.streams.values_mut() {
            while !stream.pending.is_empty() {
                Self::skip_gap(stream, &mut self.stats, out);
            }
            stream.next = None;
        }
    }

    fn report(&self, stats: &mut PipelineStats) {
        stats.reordered += self.stats.reordered;
        stats.late_dropped += self.stats.late_dropped;
        stats.lost += self.stats.lost;
    }
}
