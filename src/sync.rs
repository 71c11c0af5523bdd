//! Blocking synchronization primitives shared by the bridge and the session.
//!
//! Both are built on `crossbeam-channel`: a [`Completion`] is a `bounded(1)`
//! channel whose single message is the resolution, and a [`StopSignal`] is a
//! channel that is disconnected to signal a stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

/// Result of waiting on a [`Completion`].
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The value arrived.
    Ready(T),
    /// The operation was cancelled before it completed.
    Cancelled,
    /// The bound elapsed first.
    TimedOut,
}

/// A thread-safe, single-assignment completion handle.
///
/// The first of [`complete`](Self::complete) or [`cancel`](Self::cancel) wins;
/// every later call is a no-op that returns `false`. A value is handed to
/// exactly one waiter; later waits report [`WaitOutcome::Cancelled`].
pub struct Completion<T> {
    resolved: Arc<AtomicBool>,
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            resolved: Arc::clone(&self.resolved),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Completion<T> {
    /// Creates a pending handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            resolved: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    /// Resolves with a value. Returns false if already resolved or cancelled.
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Some(value))
    }

    /// Cancels a pending handle. Cancelling a resolved handle does nothing.
    pub fn cancel(&self) -> bool {
        self.resolve(None)
    }

    fn resolve(&self, outcome: Option<T>) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Only the winner sends, so the single slot is always free here.
        let _ = self.tx.try_send(outcome);
        true
    }

    /// Returns true once the handle is resolved or cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Blocks until resolved, cancelled, or the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                // Leave a tombstone so every later wait reports Cancelled.
                let _ = self.tx.try_send(None);
                match outcome {
                    Some(value) => WaitOutcome::Ready(value),
                    None => WaitOutcome::Cancelled,
                }
            }
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Cancelled,
        }
    }
}

/// A stop flag that sleeping threads can wait on.
///
/// Stopping drops the only sender, which wakes every receiver at once.
#[derive(Debug)]
pub struct StopSignal {
    trigger: Mutex<Option<Sender<()>>>,
    stopped: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, stopped) = bounded(0);
        Self {
            trigger: Mutex::new(Some(trigger)),
            stopped,
        }
    }

    /// Sets the flag and wakes all sleepers.
    pub fn stop(&self) {
        self.trigger.lock().take();
    }

    /// Returns true once stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self.stopped.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps up to `timeout`, returning early (with `true`) when stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.stopped.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_complete_then_wait() {
        let done = Completion::new();
        assert!(done.complete(5));
        assert_eq!(done.wait(Duration::from_millis(10)), WaitOutcome::Ready(5));
    }

    #[test]
    fn test_first_resolution_wins() {
        let done = Completion::new();
        assert!(done.complete(1));
        assert!(!done.complete(2));
        assert!(!done.cancel());
        assert_eq!(done.wait(Duration::ZERO), WaitOutcome::Ready(1));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let done: Completion<()> = Completion::new();
        done.complete(());
        assert!(!done.cancel());
        assert!(done.is_done());
    }

    #[test]
    fn test_value_is_reported_once() {
        let done = Completion::new();
        done.complete("x");
        assert_eq!(done.wait(Duration::ZERO), WaitOutcome::Ready("x"));
        assert_eq!(done.wait(Duration::ZERO), WaitOutcome::Cancelled);
    }

    #[test]
    fn test_wait_times_out() {
        let done: Completion<u8> = Completion::new();
        assert_eq!(done.wait(Duration::from_millis(20)), WaitOutcome::TimedOut);
        assert!(!done.is_done());
    }

    #[test]
    fn test_completion_across_threads() {
        let done = Completion::new();
        let remote = done.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.complete(42)
        });
        assert_eq!(done.wait(Duration::from_secs(5)), WaitOutcome::Ready(42));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_racing_complete_and_cancel_resolve_once() {
        for _ in 0..50 {
            let done = Completion::new();
            let a = done.clone();
            let b = done.clone();
            let t1 = thread::spawn(move || a.complete(()));
            let t2 = thread::spawn(move || b.cancel());
            let completed = t1.join().unwrap();
            let cancelled = t2.join().unwrap();
            assert!(completed ^ cancelled);
        }
    }

    #[test]
    fn test_cancelled_is_seen_by_every_waiter() {
        let done: Completion<u8> = Completion::new();
        assert!(done.cancel());
        assert_eq!(done.wait(Duration::ZERO), WaitOutcome::Cancelled);
        assert_eq!(done.clone().wait(Duration::ZERO), WaitOutcome::Cancelled);
    }

    #[test]
    fn test_taken_value_wakes_second_waiter() {
        let done = Completion::new();
        let second = done.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            second.wait(Duration::from_secs(5))
        });
        done.complete(7);
        let first = done.wait(Duration::from_secs(5));
        let other = handle.join().unwrap();
        assert!(matches!(
            (first, other),
            (WaitOutcome::Ready(7), WaitOutcome::Cancelled)
                | (WaitOutcome::Cancelled, WaitOutcome::Ready(7))
        ));
    }

    #[test]
    fn test_stop_signal_unset_sleeps_full_timeout() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        signal.stop();
        signal.stop();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let signal = std::sync::Arc::new(StopSignal::new());
        let remote = std::sync::Arc::clone(&signal);
        let handle = thread::spawn(move || remote.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(signal.is_stopped());
    }
}
