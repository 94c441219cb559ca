//! Background garbage-collection scheduling.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A counting semaphore bounding concurrent per-channel collection passes.
#[derive(Debug)]
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock().expect("semaphore poisoned");
        while *permits == 0 {
            permits = self.released.wait(permits).expect("semaphore poisoned");
        }
        *permits -= 1;
    }

    pub(crate) fn release(&self) {
        *self.permits.lock().expect("semaphore poisoned") += 1;
        self.released.notify_one();
    }
}

/// Shutdown signal shared with the collection thread.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    /// Sleeps for `interval` or until stopped. Returns true when stopped.
    pub(crate) fn sleep(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock().expect("shutdown signal poisoned");
        let deadline = std::time::Instant::now() + interval;
        while !*stopped {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(stopped, deadline - now)
                .expect("shutdown signal poisoned");
            stopped = guard;
        }
        true
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock().expect("shutdown signal poisoned") = true;
        self.signal.notify_all();
    }
}

/// Handle to the background collection thread.
#[derive(Debug)]
pub(crate) struct GcTask {
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) handle: JoinHandle<()>,
}

impl GcTask {
    pub(crate) fn stop(self) {
        self.shutdown.stop();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_semaphore_bounds_concurrency() {
        let sem = Arc::new(Semaphore::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let (sem, peak, current) =
                (Arc::clone(&sem), Arc::clone(&peak), Arc::clone(&current));
            handles.push(std::thread::spawn(move || {
                sem.acquire();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                current.fetch_sub(1, Ordering::SeqCst);
                sem.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_shutdown_wakes_sleeper() {
        let shutdown = Arc::new(Shutdown::default());
        let s = Arc::clone(&shutdown);
        let h = std::thread::spawn(move || s.sleep(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(10));
        shutdown.stop();
        assert!(h.join().unwrap());
    }
}
