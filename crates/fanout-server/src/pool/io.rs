use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use super::{JobOwner, OverflowPolicy, PacketQueue};
use crate::config::PoolConfig;

/// Runtime for socket I/O, timers and per-connection tasks
pub struct IoPool {
    runtime: Option<Runtime>,
    handle: Handle,
    queue_capacity: usize,
    policy: OverflowPolicy,
}

impl IoPool {
    /// Start a dedicated multi-threaded runtime
    pub fn new(config: &PoolConfig) -> std::io::Result<Self> {
        let workers = config.worker_count();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("fanout-io")
            .enable_all()
            .build()?;
        tracing::info!(workers, capacity = config.queue_capacity, policy = ?config.overflow, "io pool started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            queue_capacity: config.queue_capacity,
            policy: config.overflow,
        })
    }

    /// Run on an existing runtime instead of owning one
    pub fn from_handle(handle: Handle, config: &PoolConfig) -> Self {
        Self {
            runtime: None,
            handle,
            queue_capacity: config.queue_capacity,
            policy: config.overflow,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Spawn a task that keeps `owner` alive until it finishes
    pub fn spawn_for<O, F>(&self, owner: Arc<O>, future: F) -> JoinHandle<F::Output>
    where
        O: JobOwner + ?Sized,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(async move {
            let _owner = owner;
            future.await
        })
    }

    /// Queue using the pool's default capacity and overflow policy
    pub fn queue<T: Send>(&self) -> PacketQueue<T> {
        PacketQueue::new(self.queue_capacity, self.policy)
    }

    pub fn queue_with_capacity<T: Send>(&self, capacity: usize) -> PacketQueue<T> {
        PacketQueue::new(capacity, self.policy)
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Lifecycle;

    struct Owner(Lifecycle);

    impl JobOwner for Owner {
        fn lifecycle(&self) -> &Lifecycle {
            &self.0
        }
    }

    #[test]
    fn owned_runtime_runs_tasks() {
        let pool = IoPool::new(&PoolConfig {
            workers: 1,
            ..PoolConfig::default()
        })
        .unwrap();
        let task = pool.spawn(async { 5 });
        assert_eq!(pool.handle().block_on(task).unwrap(), 5);
    }

    #[tokio::test]
    async fn spawned_task_holds_owner() {
        let pool = IoPool::from_handle(Handle::current(), &PoolConfig::default());
        let owner = Arc::new(Owner(Lifecycle::new()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = pool.spawn_for(owner.clone(), async move {
            let _ = rx.await;
        });
        assert_eq!(Arc::strong_count(&owner), 2);
        tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(Arc::strong_count(&owner), 1);
    }
}
