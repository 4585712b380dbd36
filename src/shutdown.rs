/*!
 * Cooperative Shutdown Token
 *
 * One `Shutdown` token is created at process start and handed to every
 * long-running task at construction. Cancellation is observable three
 * ways: a flag check between operations, a cancellable sleep for
 * periodic tasks, and registered `mio::Waker`s that unpark accept loops
 * blocked in a poll.
 */

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cloneable cancellation token shared by all tasks of one process.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    // Dropping the sender closes the channel, which wakes every
    // `wait` call at once; no message is ever sent through it.
    keep_alive: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
    wakers: Mutex<Vec<mio::Waker>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                keep_alive: Mutex::new(Some(tx)),
                closed: rx,
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Trigger shutdown: flip the flag, close the wait channel, and wake
    /// every registered poller. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.keep_alive.lock().take();
        for waker in self.inner.wakers.lock().iter() {
            let _ = waker.wake();
        }
    }

    /// Sleep for up to `timeout`, returning early when cancelled.
    ///
    /// Returns `true` once shutdown has been triggered, `false` when the
    /// full timeout elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.closed.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            // closed (or a stray message): shutdown is in progress
            _ => true,
        }
    }

    /// Register a poller's waker so `cancel` can unpark it.
    ///
    /// A waker registered after cancellation is woken immediately.
    pub fn register_waker(&self, waker: mio::Waker) {
        if self.is_cancelled() {
            let _ = waker.wake();
            return;
        }
        self.inner.wakers.lock().push(waker);
        // closes the gap with a cancel that ran between the check and the push
        if self.is_cancelled() {
            for waker in self.inner.wakers.lock().iter() {
                let _ = waker.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_runs_full_timeout_when_not_cancelled() {
        let shutdown = Shutdown::new();
        let started = Instant::now();
        assert!(!shutdown.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_a_parked_wait() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        let handle = std::thread::spawn(move || clone.wait(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        shutdown.cancel();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        // idempotent, and every later wait returns immediately
        shutdown.cancel();
        assert!(shutdown.wait(Duration::from_secs(30)));
    }
}
