use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Close/release bookkeeping shared by everything that owns pool jobs.
///
/// Work that touches an owner's resources first calls [`Lifecycle::enter`];
/// once the owner is closed no new guard is handed out, and the release hook
/// runs exactly once, after the last outstanding guard drops.
pub struct Lifecycle {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    release: Mutex<Option<ReleaseHook>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            release: Mutex::new(None),
        }
    }

    pub fn with_release(hook: impl FnOnce() + Send + 'static) -> Self {
        let lifecycle = Self::new();
        lifecycle.set_release(hook);
        lifecycle
    }

    /// Install the release hook. Runs immediately if the owner already closed
    /// with nothing in flight.
    pub fn set_release(&self, hook: impl FnOnce() + Send + 'static) {
        *self.release.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
        self.try_release();
    }

    pub fn enter(&self) -> Option<LifecycleGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.exit();
            return None;
        }
        Some(LifecycleGuard { lifecycle: self })
    }

    /// Mark closed. Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.try_release();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn exit(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.try_release();
        }
    }

    fn try_release(&self) {
        if !self.closed.load(Ordering::SeqCst) || self.in_flight.load(Ordering::SeqCst) != 0 {
            return;
        }
        let hook = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

pub struct LifecycleGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.exit();
    }
}

/// Anything whose lifetime bounds the jobs submitted on its behalf
pub trait JobOwner: Send + Sync + 'static {
    fn lifecycle(&self) -> &Lifecycle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn counting() -> (Lifecycle, Arc<AtomicU32>) {
        let released = Arc::new(AtomicU32::new(0));
        let counter = released.clone();
        let lifecycle = Lifecycle::with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (lifecycle, released)
    }

    #[test]
    fn releases_on_close_when_idle() {
        let (lifecycle, released) = counting();
        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waits_for_in_flight_guard() {
        let (lifecycle, released) = counting();
        let guard = lifecycle.enter().unwrap();
        lifecycle.close();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(lifecycle.enter().is_none());
        drop(guard);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_enter_and_close_release_once() {
        for _ in 0..50 {
            let (lifecycle, released) = counting();
            let lifecycle = Arc::new(lifecycle);
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let lifecycle = lifecycle.clone();
                    std::thread::spawn(move || {
                        for _ in 0..200 {
                            if let Some(_guard) = lifecycle.enter() {
                                std::hint::spin_loop();
                            }
                        }
                    })
                })
                .collect();
            lifecycle.close();
            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(released.load(Ordering::SeqCst), 1);
        }
    }
}
