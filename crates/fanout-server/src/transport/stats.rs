use std::sync::atomic::{AtomicU64, Ordering};

use fanout_protocol::TransportStats;

/// Lock-free counters updated from the socket task and senders
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub rtcp_received: AtomicU64,
    pub rtcp_sent: AtomicU64,
    pub stun_requests: AtomicU64,
    pub srtp_auth_failures: AtomicU64,
    pub dropped_not_ready: AtomicU64,
    pub dropped_unknown_source: AtomicU64,
    pub dropped_queue_full: AtomicU64,
    pub malformed: AtomicU64,
}

impl TransportCounters {
    /// Increment and return the new value
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransportStats {
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
            rtcp_received: load(&self.rtcp_received),
            rtcp_sent: load(&self.rtcp_sent),
            stun_requests: load(&self.stun_requests),
            srtp_auth_failures: load(&self.srtp_auth_failures),
            dropped_not_ready: load(&self.dropped_not_ready),
            dropped_unknown_source: load(&self.dropped_unknown_source),
            dropped_queue_full: load(&self.dropped_queue_full),
            malformed: load(&self.malformed),
        }
    }
}
