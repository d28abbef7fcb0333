//! Monotonic timeline primitive.
//!
//! A real driver wrapper would back this with a Vulkan timeline semaphore;
//! [`HostTimeline`] is the host-only stand-in used by [`super::CpuExecutor`]
//! and is what the scheduler itself is built against everywhere (it never
//! distinguishes a "real" timeline from a host one — both are just
//! `Arc<dyn Timeline>`).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait Timeline: Send + Sync {
    /// Current value.
    fn get(&self) -> u64;
    /// Blocks the calling thread until the timeline reaches at least `value`.
    fn wait(&self, value: u64);
    /// As [`Timeline::wait`], but gives up after `timeout` and reports
    /// whether the value was reached.
    fn wait_timeout(&self, value: u64, timeout: Duration) -> bool;
    /// Sets the timeline's value. Must only ever increase; callers are
    /// responsible for monotonicity (this mirrors a semaphore `signal`).
    fn set(&self, value: u64);
}

/// A condvar-backed monotonic counter.
pub struct HostTimeline {
    value: AtomicU64,
    lock: Mutex<()>,
    wake: Condvar,
}

impl HostTimeline {
    pub fn new(initial: u64) -> Self {
        HostTimeline {
            value: AtomicU64::new(initial),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }
}

impl Default for HostTimeline {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Timeline for HostTimeline {
    fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn wait(&self, value: u64) {
        if self.value.load(Ordering::Acquire) >= value {
            return;
        }
        let mut guard = self.lock.lock();
        while self.value.load(Ordering::Acquire) < value {
            self.wake.wait(&mut guard);
        }
    }

    fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        if self.value.load(Ordering::Acquire) >= value {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.value.load(Ordering::Acquire) >= value {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let timed_out = self.wake.wait_for(&mut guard, remaining).timed_out();
            if timed_out && self.value.load(Ordering::Acquire) < value {
                return false;
            }
        }
    }

    fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_already_reached() {
        let tl = HostTimeline::new(5);
        tl.wait(3);
        assert!(tl.wait_timeout(5, Duration::from_millis(1)));
    }

    #[test]
    fn wait_blocks_until_set() {
        let tl = Arc::new(HostTimeline::new(0));
        let tl2 = tl.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tl2.set(1);
        });
        tl.wait(1);
        assert_eq!(tl.get(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let tl = HostTimeline::new(0);
        let start = std::time::Instant::now();
        assert!(!tl.wait_timeout(1, Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
