//! Blocking bridge onto a cooperative async event loop.
//!
//! The Bluetooth stack is async-only while the rest of the engine is
//! thread-based. [`AsyncBridge`] owns a worker thread that drives a
//! single-threaded tokio runtime; callers on any other thread submit futures
//! with [`AsyncBridge::run`] and block on a [`Completion`] with a bound.
//!
//! Shutdown happens in a fixed order: mark closing, cancel every tracked
//! operation, let teardown operations through [`AsyncBridge::run_cleanup`],
//! stop the loop, then join the worker with a bound.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::sync::{Completion, WaitOutcome};

/// Default bound on a bridged operation.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on joining the loop thread.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type Cancel = Box<dyn FnOnce() + Send>;

/// Runs futures on a dedicated event-loop thread for blocking callers.
pub struct AsyncBridge {
    handle: Handle,
    in_flight: Arc<Mutex<HashMap<u64, Cancel>>>,
    next_id: AtomicU64,
    closing: AtomicBool,
    stopped: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    exited: Completion<()>,
    run_timeout: Duration,
    join_timeout: Duration,
}

impl std::fmt::Debug for AsyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBridge")
            .field("in_flight", &self.in_flight_count())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

impl AsyncBridge {
    /// Starts the loop thread with default timeouts.
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DEFAULT_RUN_TIMEOUT, DEFAULT_JOIN_TIMEOUT)
    }

    /// Starts the loop thread.
    pub fn with_timeouts(run_timeout: Duration, join_timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let exited = Completion::new();

        let in_flight: Arc<Mutex<HashMap<u64, Cancel>>> = Arc::new(Mutex::new(HashMap::new()));

        let signal_exit = exited.clone();
        let leftovers = Arc::clone(&in_flight);
        let worker = thread::Builder::new()
            .name("meshlink-bridge".into())
            .spawn(move || {
                trace!("bridge loop running");
                // A dropped sender also stops the loop.
                let _ = runtime.block_on(stop_rx);
                runtime.shutdown_background();
                // Tasks dropped by the shutdown never resolve their callers.
                let stranded = drain(&mut leftovers.lock());
                for cancel in stranded {
                    cancel();
                }
                signal_exit.complete(());
                trace!("bridge loop stopped");
            })?;

        Ok(Self {
            handle,
            in_flight,
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            exited,
            run_timeout,
            join_timeout,
        })
    }

    /// Default bound used by [`run_default`](Self::run_default).
    #[must_use]
    pub const fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Runs a future on the loop, blocking up to `timeout` for its result.
    ///
    /// On timeout the operation is cancelled and [`Error::Timeout`] returned.
    /// Must not be called from the loop thread itself.
    pub fn run<F, T>(&self, future: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Admit::Open, future, timeout)
    }

    /// [`run`](Self::run) with the bridge's default timeout.
    pub fn run_default<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(future, self.run_timeout)
    }

    /// Runs a teardown operation; accepted while closing until the loop stops.
    pub fn run_cleanup<F, T>(&self, future: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Admit::Cleanup, future, timeout)
    }

    /// Spawns a long-lived task that is cancelled when the bridge closes.
    pub fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let id = self.register(Admit::Open, Box::new(move || abort.abort()))?;

        let in_flight = Arc::clone(&self.in_flight);
        self.handle.spawn(async move {
            let _ = Abortable::new(future, registration).await;
            in_flight.lock().remove(&id);
        });
        Ok(())
    }

    /// Tracks a cancel hook, refusing it once the bridge no longer admits
    /// work of this kind. The check and the insert share the `in_flight` lock
    /// with [`begin_close`](Self::begin_close) and [`stop`](Self::stop), so
    /// every admitted operation is seen by their drain.
    fn register(&self, admit: Admit, cancel: Cancel) -> Result<u64> {
        let mut in_flight = self.in_flight.lock();
        let refused = self.stopped.load(Ordering::SeqCst)
            || (admit == Admit::Open && self.closing.load(Ordering::SeqCst));
        if refused {
            return Err(Error::ShutdownInProgress);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(id, cancel);
        Ok(id)
    }

    fn submit<F, T>(&self, admit: Admit, future: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let done: Completion<Result<T>> = Completion::new();
        let (abort, registration) = AbortHandle::new_pair();

        let canceller = done.clone();
        let id = self.register(
            admit,
            Box::new(move || {
                abort.abort();
                canceller.cancel();
            }),
        )?;

        let in_flight = Arc::clone(&self.in_flight);
        let remote = done.clone();
        self.handle.spawn(async move {
            let result = Abortable::new(future, registration).await;
            in_flight.lock().remove(&id);
            match result {
                Ok(value) => {
                    remote.complete(value);
                }
                Err(_aborted) => {
                    remote.cancel();
                }
            }
        });

        match done.wait(timeout) {
            WaitOutcome::Ready(result) => result,
            WaitOutcome::Cancelled => Err(Error::ShutdownInProgress),
            WaitOutcome::TimedOut => {
                let cancel = self.in_flight.lock().remove(&id);
                if let Some(cancel) = cancel {
                    cancel();
                }
                // The operation may have finished between the timeout and the cancel.
                match done.wait(Duration::ZERO) {
                    WaitOutcome::Ready(result) => result,
                    WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                        debug!(id, ?timeout, "bridged operation timed out");
                        Err(Error::timeout(timeout))
                    }
                }
            }
        }
    }

    /// Returns true once close has started.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Number of operations currently tracked.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Marks the bridge closing and cancels every tracked operation.
    ///
    /// Returns false if close had already started.
    pub fn begin_close(&self) -> bool {
        let cancels = {
            let mut in_flight = self.in_flight.lock();
            if self.closing.swap(true, Ordering::SeqCst) {
                return false;
            }
            drain(&mut in_flight)
        };
        debug!(cancelled = cancels.len(), "bridge closing");
        for cancel in cancels {
            cancel();
        }
        true
    }

    /// Stops the loop and joins the worker thread, waiting at most the join
    /// timeout. Teardown operations still running are cancelled first, so
    /// their callers get [`Error::ShutdownInProgress`] instead of waiting out
    /// their own bound.
    pub fn stop(&self) {
        let cancels = {
            let mut in_flight = self.in_flight.lock();
            self.closing.store(true, Ordering::SeqCst);
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            drain(&mut in_flight)
        };
        if !cancels.is_empty() {
            debug!(cancelled = cancels.len(), "cancelling teardown operations");
        }
        for cancel in cancels {
            cancel();
        }
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        match self.exited.wait(self.join_timeout) {
            WaitOutcome::Ready(()) => {
                if worker.join().is_err() {
                    warn!("bridge worker panicked");
                }
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                warn!(timeout = ?self.join_timeout, "bridge worker did not stop in time; detaching");
            }
        }
    }

    /// Full shutdown without a teardown step. Calling it again is a no-op.
    pub fn close(&self) {
        if self.begin_close() {
            self.stop();
        }
    }
}

/// Which operations the bridge still admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    /// Regular work, refused once closing starts.
    Open,
    /// Teardown work, refused only once the loop stops.
    Cleanup,
}

fn drain(in_flight: &mut HashMap<u64, Cancel>) -> Vec<Cancel> {
    in_flight.drain().map(|(_, cancel)| cancel).collect()
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.begin_close();
        self.stop();
    }
}
