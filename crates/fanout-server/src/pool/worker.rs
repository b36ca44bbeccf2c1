//! CPU worker pool
//!
//! Named OS threads pull jobs from one bounded queue. What happens when the
//! queue is full depends on the pool's [`OverflowPolicy`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use fanout_protocol::{MediaKind, PoolStats};
use tokio::sync::{Notify, oneshot};

use super::{JobOwner, OverflowPolicy};
use crate::config::PoolConfig;
use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Eviction class of a job. Under `DropOldest`, video jobs are evicted before
/// audio jobs; control jobs are never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    Control,
    Audio,
    Video,
}

impl From<MediaKind> for JobPriority {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => JobPriority::Audio,
            MediaKind::Video => JobPriority::Video,
        }
    }
}

struct Queued {
    job: Job,
    priority: JobPriority,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    skipped_closed: AtomicU64,
    dropped_oldest: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

struct Shared {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    sender: Sender<Queued>,
    receiver: Receiver<Queued>,
    /// Held by `DropOldest` producers so a drain and refill is never
    /// interleaved with another push
    evicting: Mutex<()>,
    /// Disconnected on shutdown; wakes workers and blocked submitters
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    shutdown: AtomicBool,
    /// Wakes async submitters waiting under `Block`
    space: Notify,
    counters: Counters,
}

enum PushResult {
    Accepted,
    Full(Queued),
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn push(&self, item: Queued) -> Result<PushResult, PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::ShuttingDown);
        }
        match self.policy {
            OverflowPolicy::Block => match self.sender.try_send(item) {
                Ok(()) => Ok(PushResult::Accepted),
                Err(TrySendError::Full(item)) => Ok(PushResult::Full(item)),
                Err(TrySendError::Disconnected(_)) => Err(PoolError::ShuttingDown),
            },
            OverflowPolicy::DropNewest => match self.sender.try_send(item) {
                Ok(()) => Ok(PushResult::Accepted),
                Err(TrySendError::Full(_)) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(PoolError::QueueFull)
                }
                Err(TrySendError::Disconnected(_)) => Err(PoolError::ShuttingDown),
            },
            OverflowPolicy::DropOldest => self.push_evicting(item),
        }
    }

    fn push_evicting(&self, item: Queued) -> Result<PushResult, PoolError> {
        let _producer = self.evicting.lock().unwrap_or_else(PoisonError::into_inner);
        let item = match self.sender.try_send(item) {
            Ok(()) => return Ok(PushResult::Accepted),
            Err(TrySendError::Full(item)) => item,
            Err(TrySendError::Disconnected(_)) => return Err(PoolError::ShuttingDown),
        };

        // Only workers take from the channel while we hold the producer
        // lock, so everything drained here fits back in.
        let mut queued: Vec<Queued> = self.receiver.try_iter().take(self.capacity).collect();
        let evicted = victim(&queued).map(|index| queued.remove(index));
        for job in queued {
            if self.sender.try_send(job).is_err() {
                self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            }
        }
        let Some(evicted) = evicted else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::QueueFull);
        };
        if self.sender.try_send(item).is_err() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::QueueFull);
        }

        // The evicted job's result channel closes here
        drop(evicted);
        let dropped = self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            tracing::warn!(pool = %self.name, dropped, "worker queue full, dropped oldest job");
        }
        Ok(PushResult::Accepted)
    }

    fn next_job(&self) -> Option<Queued> {
        let item = crossbeam::select! {
            recv(self.receiver) -> item => item.ok(),
            recv(self.stop_rx) -> _ => None,
        };
        if item.is_some() {
            self.space.notify_waiters();
        }
        item
    }
}

/// Oldest video job, else oldest audio job
fn victim(jobs: &[Queued]) -> Option<usize> {
    [JobPriority::Video, JobPriority::Audio]
        .into_iter()
        .find_map(|priority| jobs.iter().position(|q| q.priority == priority))
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(name: &str, config: &PoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = channel::bounded(capacity);
        let (stop_tx, stop_rx) = channel::bounded(0);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            capacity,
            policy: config.overflow,
            sender,
            receiver,
            evicting: Mutex::new(()),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            shutdown: AtomicBool::new(false),
            space: Notify::new(),
            counters: Counters::default(),
        });

        let workers = config.worker_count();
        for index in 0..workers {
            let shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                tracing::error!(pool = name, error = %e, "failed to spawn worker thread");
            }
        }
        tracing::info!(pool = name, workers, capacity = config.queue_capacity, policy = ?config.overflow, "worker pool started");

        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Queue a job from synchronous code. Under `Block` this blocks the
    /// calling thread until there is room.
    pub fn submit<F>(&self, priority: JobPriority, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let item = Queued {
            job: Box::new(job),
            priority,
        };
        match self.shared.push(item)? {
            PushResult::Accepted => Ok(()),
            PushResult::Full(item) => crossbeam::select! {
                send(self.shared.sender, item) -> sent => match sent {
                    Ok(()) if !self.shared.is_shutdown() => Ok(()),
                    _ => Err(PoolError::ShuttingDown),
                },
                recv(self.shared.stop_rx) -> _ => Err(PoolError::ShuttingDown),
            },
        }
    }

    /// Queue a job from async code. Under `Block` the caller's task waits
    /// without blocking its thread.
    pub async fn submit_async<F>(&self, priority: JobPriority, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let mut item = Queued {
            job: Box::new(job),
            priority,
        };
        loop {
            let mut notified = pin!(self.shared.space.notified());
            notified.as_mut().enable();
            match self.shared.push(item)? {
                PushResult::Accepted => return Ok(()),
                PushResult::Full(back) => {
                    item = back;
                    notified.await;
                }
            }
        }
    }

    /// Run `f` on the pool and wait for its result
    pub async fn run<F, R>(&self, priority: JobPriority, f: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.submit_async(priority, move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(pool = %shared.name, "job panicked");
                PoolError::Panicked
            });
            let _ = tx.send(result);
        })
        .await?;
        self.await_result(rx).await
    }

    /// Run `f` against `owner` on the pool.
    ///
    /// The owner is kept alive until the job finishes. If the owner's
    /// lifecycle is closed by the time the job runs, `f` is skipped and
    /// `PoolError::OwnerClosed` is returned.
    pub async fn run_for<O, F, R>(&self, owner: Arc<O>, priority: JobPriority, f: F) -> Result<R, PoolError>
    where
        O: JobOwner + ?Sized,
        F: FnOnce(&O) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.submit_async(priority, move || {
            let result = match owner.lifecycle().enter() {
                Some(_guard) => catch_unwind(AssertUnwindSafe(|| f(&owner))).map_err(|_| {
                    shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(pool = %shared.name, "job panicked");
                    PoolError::Panicked
                }),
                None => {
                    shared.counters.skipped_closed.fetch_add(1, Ordering::Relaxed);
                    Err(PoolError::OwnerClosed)
                }
            };
            let _ = tx.send(result);
        })
        .await?;
        self.await_result(rx).await
    }

    async fn await_result<R>(&self, rx: oneshot::Receiver<Result<R, PoolError>>) -> Result<R, PoolError> {
        match rx.await {
            Ok(result) => result,
            Err(_) if self.shared.is_shutdown() => Err(PoolError::ShuttingDown),
            Err(_) => Err(PoolError::Evicted),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            skipped_closed: c.skipped_closed.load(Ordering::Relaxed),
            dropped_oldest: c.dropped_oldest.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            queued: self.shared.sender.len(),
        }
    }

    /// Stop the workers. Jobs still queued are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.shared.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let dropped = self.shared.receiver.try_iter().count();
        self.shared.space.notify_waiters();
        if dropped > 0 {
            tracing::debug!(pool = %self.shared.name, dropped, "dropping queued jobs on shutdown");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while let Some(item) = shared.next_job() {
        if catch_unwind(AssertUnwindSafe(item.job)).is_err() {
            shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(pool = %shared.name, "job panicked");
        }
        shared.counters.executed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Lifecycle;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Owner {
        lifecycle: Lifecycle,
    }

    impl JobOwner for Owner {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }
    }

    fn pool(workers: usize, capacity: usize, overflow: OverflowPolicy) -> WorkerPool {
        WorkerPool::new(
            "test-cpu",
            &PoolConfig {
                workers,
                queue_capacity: capacity,
                overflow,
            },
        )
    }

    /// Occupy the single worker until the returned sender is dropped
    fn park_worker(pool: &WorkerPool) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(JobPriority::Control, move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[tokio::test]
    async fn run_returns_result() {
        let pool = pool(2, 16, OverflowPolicy::DropOldest);
        let value = pool.run(JobPriority::Control, || 6 * 7).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.stats().executed, 1);
    }

    #[tokio::test]
    async fn panicking_job_is_contained() {
        let pool = pool(1, 16, OverflowPolicy::DropOldest);
        let result: Result<(), _> = pool.run(JobPriority::Control, || panic!("boom")).await;
        assert_eq!(result, Err(PoolError::Panicked));
        // The worker survives
        assert_eq!(pool.run(JobPriority::Control, || 1).await, Ok(1));
        assert_eq!(pool.stats().panicked, 1);
    }

    #[tokio::test]
    async fn closed_owner_skips_job() {
        let pool = pool(1, 16, OverflowPolicy::DropOldest);
        let owner = Arc::new(Owner {
            lifecycle: Lifecycle::new(),
        });
        let ran = Arc::new(AtomicUsize::new(0));

        let release = park_worker(&pool);
        let pending = {
            let ran = ran.clone();
            let owner = owner.clone();
            let pool = &pool;
            async move {
                pool.run_for(owner, JobPriority::Audio, move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }
        };
        let handle = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            owner.lifecycle().close();
            drop(release);
        };
        let (result, ()) = tokio::join!(pending, handle);

        assert_eq!(result, Err(PoolError::OwnerClosed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().skipped_closed, 1);
    }

    #[test]
    fn drop_oldest_evicts_video_before_audio() {
        let pool = pool(1, 2, OverflowPolicy::DropOldest);
        let release = park_worker(&pool);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        for (label, priority) in [("audio", JobPriority::Audio), ("video", JobPriority::Video)] {
            let order = order.clone();
            pool.submit(priority, move || order.lock().unwrap().push(label))
                .unwrap();
        }
        {
            let order = order.clone();
            pool.submit(JobPriority::Audio, move || {
                order.lock().unwrap().push("late");
                done_tx.send(()).unwrap();
            })
            .unwrap();
        }
        drop(release);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["audio", "late"]);
        assert_eq!(pool.stats().dropped_oldest, 1);
    }

    #[test]
    fn drop_newest_rejects_when_full() {
        let pool = pool(1, 1, OverflowPolicy::DropNewest);
        let _release = park_worker(&pool);
        pool.submit(JobPriority::Video, || {}).unwrap();
        assert_eq!(pool.submit(JobPriority::Video, || {}), Err(PoolError::QueueFull));
        assert_eq!(pool.stats().rejected, 1);
    }

    #[test]
    fn control_jobs_are_never_evicted() {
        let pool = pool(1, 1, OverflowPolicy::DropOldest);
        let _release = park_worker(&pool);
        pool.submit(JobPriority::Control, || {}).unwrap();
        assert_eq!(pool.submit(JobPriority::Video, || {}), Err(PoolError::QueueFull));
    }

    #[tokio::test]
    async fn evicted_job_reports_eviction() {
        let pool = pool(1, 1, OverflowPolicy::DropOldest);
        let release = park_worker(&pool);

        let first = pool.run(JobPriority::Video, || 1);
        let second = async {
            tokio::task::yield_now().await;
            pool.run(JobPriority::Video, || 2).await
        };
        let releaser = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(release);
        };
        let (first, second, ()) = tokio::join!(first, second, releaser);
        assert_eq!(first, Err(PoolError::Evicted));
        assert_eq!(second, Ok(2));
    }

    #[tokio::test]
    async fn block_policy_waits_for_room() {
        let pool = pool(1, 1, OverflowPolicy::Block);
        let release = park_worker(&pool);
        pool.submit(JobPriority::Video, || {}).unwrap();

        let blocked = pool.run(JobPriority::Video, || "ran");
        let releaser = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(release);
        };
        let (result, ()) = tokio::join!(blocked, releaser);
        assert_eq!(result, Ok("ran"));
        assert_eq!(pool.stats().rejected, 0);
    }

    #[test]
    fn shutdown_releases_blocked_submitter() {
        let pool = Arc::new(pool(1, 1, OverflowPolicy::Block));
        let _release = park_worker(&pool);
        pool.submit(JobPriority::Video, || {}).unwrap();

        let blocked = {
            let pool = pool.clone();
            thread::spawn(move || pool.submit(JobPriority::Video, || {}))
        };
        thread::sleep(Duration::from_millis(20));
        pool.shutdown();

        assert_eq!(blocked.join().unwrap(), Err(PoolError::ShuttingDown));
        assert_eq!(pool.submit(JobPriority::Control, || {}), Err(PoolError::ShuttingDown));
    }
}
