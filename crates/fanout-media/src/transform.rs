//! Packet transformer chain and outbound stream rewriting

use std::collections::HashMap;

use fanout_protocol::{MediaKind, PipelineStats};

use crate::packet::MediaPacket;

/// One stage of a media pipeline.
///
/// A stage consumes a packet and pushes zero or more packets downstream; it
/// never modifies the input in place.
pub trait PacketTransform: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, packet: MediaPacket, out: &mut Vec<MediaPacket>);

    /// Emit anything held back, e.g. on source change or shutdown
    fn flush(&mut self, _out: &mut Vec<MediaPacket>) {}

    /// Add this stage's counters to `stats`
    fn report(&self, _stats: &mut PipelineStats) {}
}

#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Box<dyn PacketTransform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl PacketTransform + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn process(&mut self, packet: MediaPacket) -> Vec<MediaPacket> {
        self.run_from(0, vec![packet])
    }

    /// Flush every stage in order, pushing flushed packets through the stages
    /// after it.
    pub fn flush(&mut self) -> Vec<MediaPacket> {
        let mut output = Vec::new();
        for index in 0..self.stages.len() {
            let mut flushed = Vec::new();
            self.stages[index].flush(&mut flushed);
            output.extend(self.run_from(index + 1, flushed));
        }
        output
    }

    pub fn report(&self, stats: &mut PipelineStats) {
        for stage in &self.stages {
            stage.report(stats);
        }
    }

    fn run_from(&mut self, start: usize, mut current: Vec<MediaPacket>) -> Vec<MediaPacket> {
        for stage in self.stages.iter_mut().skip(start) {
            if current.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(current.len());
            for packet in current.drain(..) {
                stage.process(packet, &mut next);
            }
            current = next;
        }
        current
    }
}

#[derive(Debug, Default)]
struct RewriteState {
    source_ssrc: Option<u32>,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: Option<u16>,
    last_ts: Option<u32>,
}

/// Keeps each outbound stream continuous when the packets feeding it switch
/// to a different source SSRC, e.g. after a publisher change.
///
/// The first source passes through untouched. Later sources are shifted so
/// their first packet follows the last one sent.
#[derive(Debug, Default)]
pub struct StreamRewriter {
    ssrc: HashMap<MediaKind, u32>,
    streams: HashMap<MediaKind, RewriteState>,
}

impl StreamRewriter {
    /// Timestamp gap inserted at a source switch, about one frame
    const AUDIO_SWITCH_GAP: u32 = 960;
    const VIDEO_SWITCH_GAP: u32 = 3000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the SSRC of every outgoing packet of `kind`
    pub fn with_ssrc(mut self, kind: MediaKind, ssrc: u32) -> Self {
        self.ssrc.insert(kind, ssrc);
        self
    }
}

impl PacketTransform for StreamRewriter {
    fn name(&self) -> &'static str {
        "stream_rewriter"
    }

    fn process(&mut self, packet: MediaPacket, out: &mut Vec<MediaPacket>) {
        let kind = packet.kind();
        let state = self.streams.entry(kind).or_default();

        if state.source_ssrc != Some(packet.ssrc()) {
            if let (Some(last_seq), Some(last_ts)) = (state.last_seq, state.last_ts) {
                let gap = match kind {
                    MediaKind::Audio => Self::AUDIO_SWITCH_GAP,
                    MediaKind::Video => Self::VIDEO_SWITCH_GAP,
                };
                state.seq_offset = last_seq.wrapping_add(1).wrapping_sub(packet.sequence_number());
                state.ts_offset = last_ts.wrapping_add(gap).wrapping_sub(packet.timestamp());
            }
            state.source_ssrc = Some(packet.ssrc());
        }

        let seq = packet.sequence_number().wrapping_add(state.seq_offset);
        let ts = packet.timestamp().wrapping_add(state.ts_offset);
        let ssrc = self.ssrc.get(&kind).copied().unwrap_or(packet.ssrc());
        state.last_seq = Some(seq);
        state.last_ts = Some(ts);

        if seq == packet.sequence_number() && ts == packet.timestamp() && ssrc == packet.ssrc() {
            out.push(packet);
        } else {
            out.push(packet.rewritten(ssrc, seq, ts));
        }
    }
}
