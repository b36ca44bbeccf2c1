use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::OverflowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item
    Evicted,
    /// Rejected: queue full under `DropNewest`, or full under `Block` when
    /// pushed from synchronous code
    Dropped,
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

/// Bounded single-consumer packet queue between I/O tasks.
///
/// Producers may be synchronous (callbacks on the I/O runtime) or async.
pub struct PacketQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> PacketQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                capacity: capacity.max(1),
                policy,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push without waiting. Under `Block` a full queue drops the item.
    pub fn push(&self, item: T) -> PushOutcome {
        match self.try_push(item) {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
        }
    }

    /// Push, waiting for room when the policy is `Block`
    pub async fn push_async(&self, mut item: T) -> PushOutcome {
        loop {
            let writable = self.inner.writable.notified();
            match self.try_push(item) {
                Ok(outcome) => return outcome,
                Err(back) => {
                    item = back;
                    writable.await;
                }
            }
        }
    }

    /// `Err` hands the item back when the queue is full under `Block`
    fn try_push(&self, item: T) -> Result<PushOutcome, T> {
        let evicted;
        {
            let mut state = self.lock();
            if state.closed {
                return Ok(PushOutcome::Closed);
            }
            if state.items.len() < self.inner.capacity {
                state.items.push_back(item);
                drop(state);
                self.inner.readable.notify_one();
                return Ok(PushOutcome::Queued);
            }
            match self.inner.policy {
                OverflowPolicy::Block => return Err(item),
                OverflowPolicy::DropNewest => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(PushOutcome::Dropped);
                }
                OverflowPolicy::DropOldest => {
                    evicted = state.items.pop_front();
                    state.items.push_back(item);
                }
            }
        }
        drop(evicted);
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        self.inner.readable.notify_one();
        Ok(PushOutcome::Evicted)
    }

    /// Next item, or `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.inner.readable.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.inner.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.inner.writable.notify_one();
        }
        item
    }

    /// Stop accepting items. Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.readable.notify_one();
        self.inner.writable.notify_one();
        self.inner.writable.notify_waiters();
    }

    /// Close and discard everything queued
    pub fn close_and_clear(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        drop(drained);
        self.inner.readable.notify_one();
        self.inner.writable.notify_one();
        self.inner.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
