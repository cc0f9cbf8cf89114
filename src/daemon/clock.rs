//! Time source and cancellable sleeps for limiter threads.
//!
//! Every blocking point of a limiter goes through [`Clock::sleep`], so
//! cancelling the shared [`CancelToken`] wakes all limiters immediately
//! instead of waiting out the current slice.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Cancelled,
}

struct CancelInner {
    cancelled: AtomicBool,
    // Dropping the sender disconnects every receiver, waking blocked sleeps.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Cloneable cancellation flag shared by a supervisor and its limiters.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.tx.lock().take();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Wake {
        if self.is_cancelled() {
            return Wake::Cancelled;
        }
        if duration.is_zero() {
            return Wake::Elapsed;
        }
        match self.inner.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Wake::Elapsed,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Wake::Cancelled,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Monotonic time plus cancellable sleep.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Wake;
}

/// Wall-clock implementation.
#[derive(Debug, Clone)]
pub struct SystemClock {
    cancel: CancelToken,
}

impl SystemClock {
    #[must_use]
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Wake {
        self.cancel.sleep(duration)
    }
}

impl<C: Clock + Sync> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> Wake {
        (**self).sleep(duration)
    }
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
    cancel_after: Option<usize>,
    overrun: Duration,
}

/// Virtual clock for deterministic tests: sleeping advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState {
                offset: Duration::ZERO,
                sleeps: Vec::new(),
                cancel_after: None,
                overrun: Duration::ZERO,
            }),
        }
    }

    /// Report cancellation from the `n`-th sleep onward (0-based).
    pub fn cancel_after(&self, sleeps: usize) {
        self.state.lock().cancel_after = Some(sleeps);
    }

    /// Make every subsequent sleep take this much longer than requested.
    pub fn set_overrun(&self, overrun: Duration) {
        self.state.lock().overrun = overrun;
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().offset += by;
    }

    /// Every sleep requested so far, cancelled ones included.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().offset
    }

    fn sleep(&self, duration: Duration) -> Wake {
        let mut state = self.state.lock();
        let index = state.sleeps.len();
        state.sleeps.push(duration);
        if state.cancel_after.is_some_and(|limit| index >= limit) {
            return Wake::Cancelled;
        }
        let overrun = state.overrun;
        state.offset += duration + overrun;
        Wake::Elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_elapses_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(20)), Wake::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_blocked_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let wake = sleeper.sleep(Duration::from_secs(30));
            (wake, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (wake, waited) = handle.join().unwrap();
        assert_eq!(wake, Wake::Cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn cancelled_token_never_sleeps() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.sleep(Duration::ZERO), Wake::Cancelled);
        assert_eq!(token.sleep(Duration::from_secs(60)), Wake::Cancelled);
    }

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.sleep(Duration::from_millis(40)), Wake::Elapsed);
        assert_eq!(clock.now() - t0, Duration::from_millis(40));
        clock.set_overrun(Duration::from_millis(15));
        clock.sleep(Duration::from_millis(10));
        assert_eq!(clock.now() - t0, Duration::from_millis(65));
        clock.cancel_after(2);
        assert_eq!(clock.sleep(Duration::from_millis(10)), Wake::Cancelled);
        assert_eq!(clock.sleeps().len(), 3);
    }
}
