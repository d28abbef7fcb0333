//! Background worker that runs a function `0, 1, 2, ...` times, suspending
//! itself whenever it has caught up with its target and waking back up when
//! [`CounterWorker::advance`] raises the target.
//!
//! Ported from the scheduler's counter-worker thread: the double-checked
//! suspend (an unsynchronized peek, then a locked re-check before actually
//! suspending) is load-bearing — it's what lets `advance` wake a worker that
//! is on the verge of suspending without losing the wakeup.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

struct Shared {
    counter: AtomicU64,
    target: AtomicU64,
    suspending: AtomicBool,
    stopped: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// A daemon-style worker thread that calls `fn(i)` for `i = 0, 1, 2, ...`
/// up to the current target, suspending between bursts instead of busy
/// waiting.
pub struct CounterWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CounterWorker {
    /// Spawns the worker thread. `f` is called on the worker thread only,
    /// strictly in order, once per count from 0 up to whatever `advance`
    /// has requested.
    pub fn spawn(name: impl Into<String>, mut f: impl FnMut(u64) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            counter: AtomicU64::new(0),
            target: AtomicU64::new(0),
            suspending: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let shared = worker_shared;
                loop {
                    if shared.suspending.load(Ordering::Acquire) {
                        let mut guard = shared.wake_lock.lock();
                        loop {
                            if shared.stopped.load(Ordering::Acquire) {
                                return;
                            }
                            if shared.counter.load(Ordering::Acquire) < shared.target.load(Ordering::Acquire) {
                                break;
                            }
                            shared.wake.wait(&mut guard);
                        }
                        shared.suspending.store(false, Ordering::Release);
                    }
                    if shared.stopped.load(Ordering::Acquire) {
                        return;
                    }
                    // Quick and unsafe check.
                    if shared.counter.load(Ordering::Acquire) >= shared.target.load(Ordering::Acquire) {
                        // Might want to suspend -- check again, but safe.
                        let _guard = shared.wake_lock.lock();
                        if shared.counter.load(Ordering::Acquire) >= shared.target.load(Ordering::Acquire) {
                            shared.suspending.store(true, Ordering::Release);
                            continue;
                        }
                    }
                    let i = shared.counter.load(Ordering::Acquire);
                    f(i);
                    shared.counter.fetch_add(1, Ordering::AcqRel);
                }
            })
            .expect("failed to spawn counter worker thread");

        CounterWorker {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Number of finished iterations.
    pub fn count(&self) -> u64 {
        self.shared.counter.load(Ordering::Acquire)
    }

    /// Total number of issued iterations.
    pub fn target(&self) -> u64 {
        self.shared.target.load(Ordering::Acquire)
    }

    /// Raises the target by `n` and wakes the worker if it is suspending.
    pub fn advance(&self, n: u64) {
        self.shared.target.fetch_add(n, Ordering::AcqRel);
        let _guard = self.shared.wake_lock.lock();
        if self.shared.suspending.load(Ordering::Acquire) {
            self.shared.wake.notify_all();
        }
    }

    /// Stops the worker thread after its current iteration (if any) and
    /// joins it. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        {
            let _guard = self.shared.wake_lock.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CounterWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
