//! Thread pools
//!
//! Two explicitly constructed pools are injected into every connection and
//! router: a CPU pool of OS threads for codec and crypto work, and an I/O pool
//! (a tokio runtime) for sockets, timers and packet queues.

mod io;
mod lifecycle;
mod queue;
mod worker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use io::IoPool;
pub use lifecycle::{JobOwner, Lifecycle, LifecycleGuard};
pub use queue::{PacketQueue, PushOutcome};
pub use worker::{JobPriority, WorkerPool};

use crate::config::PoolsConfig;

/// What a bounded queue does when it is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room (back-pressure on the producer)
    Block,
    /// Reject the new item
    DropNewest,
    /// Evict the oldest droppable item to make room
    DropOldest,
}

#[derive(Clone)]
pub struct Pools {
    pub cpu: Arc<WorkerPool>,
    pub io: Arc<IoPool>,
}

impl Pools {
    pub fn new(config: &PoolsConfig) -> std::io::Result<Self> {
        Ok(Self {
            cpu: Arc::new(WorkerPool::new("fanout-cpu", &config.cpu)),
            io: Arc::new(IoPool::new(&config.io)?),
        })
    }

    /// Use an existing tokio runtime for I/O, e.g. the one a test runs on
    pub fn with_io_handle(config: &PoolsConfig, handle: tokio::runtime::Handle) -> Self {
        Self {
            cpu: Arc::new(WorkerPool::new("fanout-cpu", &config.cpu)),
            io: Arc::new(IoPool::from_handle(handle, &config.io)),
        }
    }
}
