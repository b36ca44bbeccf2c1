use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use fanout_media::{EncodedPayload, MediaPacket};
use fanout_protocol::{CodecParameters, ConnectionId, MediaKind};

use super::MediaSink;

/// How packets of one publisher payload type reach a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Same codec: relay as is, rewriting the payload type number if needed
    Direct { payload_type: u8 },
    /// Decode and re-encode into the subscriber's codec
    Transcode { target: CodecParameters },
    /// A codec needed for this route is unavailable
    Disabled,
}

/// Route for every publisher payload type the subscriber can receive.
///
/// Same codec relays directly. Otherwise the subscriber's first codec of the
/// same media kind is the transcode target. A media kind the subscriber did
/// not negotiate at all is not routed.
pub fn compute_routes(
    publisher: &[CodecParameters],
    subscriber: &[CodecParameters],
) -> HashMap<u8, Route> {
    publisher
        .iter()
        .filter_map(|source| {
            let route = if let Some(same) = subscriber.iter().find(|s| source.is_compatible_with(s)) {
                Route::Direct {
                    payload_type: same.payload_type,
                }
            } else {
                let target = subscriber.iter().find(|s| s.kind() == source.kind())?;
                Route::Transcode {
                    target: target.clone(),
                }
            };
            Some((source.payload_type, route))
        })
        .collect()
}

/// Output stream state for one (subscription, media kind) transcode.
///
/// Transcoded packets get a fresh SSRC and their own sequence numbers.
/// Timestamps follow the source clock, converted to the target clock rate.
#[derive(Debug)]
pub struct TranscoderContext {
    ssrc: u32,
    next_sequence: u16,
    source_clock: u32,
    target_clock: u32,
    first_source_ts: Option<u32>,
    base_ts: u32,
}

impl TranscoderContext {
    pub fn new(source_clock: u32, target_clock: u32) -> Self {
        Self {
            ssrc: rand::random(),
            next_sequence: rand::random::<u16>() & 0x7fff,
            source_clock: source_clock.max(1),
            target_clock,
            first_source_ts: None,
            base_ts: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn map_timestamp(&mut self, source_ts: u32) -> u32 {
        let first = *self.first_source_ts.get_or_insert_with(|| {
            self.base_ts = (source_ts as u64 * self.target_clock as u64 / self.source_clock as u64) as u32;
            source_ts
        });
        let delta = source_ts.wrapping_sub(first) as i32 as i64;
        let scaled = delta * self.target_clock as i64 / self.source_clock as i64;
        self.base_ts.wrapping_add(scaled as u32)
    }

    /// Wrap encoder output `index` for `source` into this output stream
    pub fn stamp(
        &mut self,
        source: &MediaPacket,
        target: &CodecParameters,
        payload: EncodedPayload,
        index: usize,
    ) -> MediaPacket {
        let mut timestamp = self.map_timestamp(source.timestamp());
        if source.kind() == MediaKind::Audio {
            // Encoders re-frame audio into 20ms packets
            timestamp = timestamp.wrapping_add(index as u32 * (target.clock_rate() / 50));
        }
        let sequence_number = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        MediaPacket::builder(source.kind())
            .ssrc(self.ssrc)
            .sequence_number(sequence_number)
            .timestamp(timestamp)
            .payload_type(target.payload_type)
            .marker(payload.marker)
            .payload(payload.payload)
            .arrival(source.arrival())
            .build()
    }
}

/// One subscriber attached to a router
pub struct Subscription {
    sink: Arc<dyn MediaSink>,
    codecs: Vec<CodecParameters>,
    routes: RwLock<HashMap<u8, Route>>,
    live: AtomicBool,
    contexts: Mutex<HashMap<MediaKind, TranscoderContext>>,
}

impl Subscription {
    pub fn new(sink: Arc<dyn MediaSink>, publisher_codecs: &[CodecParameters]) -> Self {
        let codecs = sink.codecs();
        let routes = compute_routes(publisher_codecs, &codecs);
        Self {
            sink,
            codecs,
            routes: RwLock::new(routes),
            live: AtomicBool::new(true),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.sink.id()
    }

    pub fn sink(&self) -> &Arc<dyn MediaSink> {
        &self.sink
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop delivery; packets already past the liveness check may still land
    pub fn retire(&self) {
        self.live.store(false, Ordering::Release);
        self.contexts().clear();
    }

    pub fn route(&self, payload_type: u8) -> Option<Route> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&payload_type)
            .cloned()
    }

    pub fn routes(&self) -> HashMap<u8, Route> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// New publisher: recompute routes and forget transcode state
    pub fn reroute(&self, publisher_codecs: &[CodecParameters]) {
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) =
            compute_routes(publisher_codecs, &self.codecs);
        self.contexts().clear();
    }

    /// Disable the route for `payload_type`. Returns `true` if it was not
    /// already disabled.
    pub fn disable(&self, payload_type: u8) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.get_mut(&payload_type) {
            Some(Route::Disabled) | None => false,
            Some(route) => {
                *route = Route::Disabled;
                true
            }
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<MediaKind, TranscoderContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp transcoder output for this subscriber, allocating its context
    /// on first use. A retired subscription gets nothing.
    pub fn stamp(
        &self,
        source: &MediaPacket,
        source_clock: u32,
        target: &CodecParameters,
        payloads: &[EncodedPayload],
    ) -> Vec<MediaPacket> {
        // Checked under the contexts lock so `retire` cannot clear before
        // a context is inserted
        let mut contexts = self.contexts();
        if !self.is_live() {
            return Vec::new();
        }
        let context = contexts
            .entry(source.kind())
            .or_insert_with(|| TranscoderContext::new(source_clock, target.clock_rate()));
        payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| context.stamp(source, target, payload.clone(), index))
            .collect()
    }
}
