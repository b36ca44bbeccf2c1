//! Non-WebRTC endpoints
//!
//! Files and generators that publish into or record from a router through the
//! same source/sink interface as live connections. They have no ICE or DTLS
//! state.

mod file;
pub mod rtpdump;
mod synthetic;

use std::sync::{Arc, Mutex, PoisonError};

use fanout_media::MediaPacket;

pub use file::{FileSink, FileSource};
pub use synthetic::SyntheticSource;

use crate::pool::{PacketQueue, PushOutcome};

/// The router feed a source is currently attached to, if any
#[derive(Clone, Default)]
pub(crate) struct FeedSlot {
    feed: Arc<Mutex<Option<PacketQueue<MediaPacket>>>>,
}

impl FeedSlot {
    pub fn set(&self, feed: Option<PacketQueue<MediaPacket>>) {
        *self.feed.lock().unwrap_or_else(PoisonError::into_inner) = feed;
    }

    pub fn is_attached(&self) -> bool {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Push into the attached feed. `false` if detached or the feed is closed.
    pub fn push(&self, packet: MediaPacket) -> bool {
        let feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match feed {
            Some(feed) => !matches!(feed.push(packet), PushOutcome::Closed),
            None => false,
        }
    }
}
