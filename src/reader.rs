//! Background reader and link supervisor.
//!
//! One named thread per connection reads the transport with a bounded timeout,
//! runs bytes through the frame decoder and feeds each frame to the session.
//! Errors never reach callers from here: a failed read, a failed write flagged
//! by another thread, or a silent link is reported to the session as a loss,
//! after which the same thread reconnects with backoff when configured to.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use crate::client::Link;
use crate::error::Result;
use crate::event::Event;
use crate::protocol::{Decoded, FrameDecoder};
use crate::sync::{Completion, StopSignal, WaitOutcome};

/// Longest console line kept before it is emitted unterminated.
const MAX_CONSOLE_LINE: usize = 1024;

/// Assembles device console output into lines.
#[derive(Debug, Default)]
pub struct ConsoleLines {
    partial: BytesMut,
}

impl ConsoleLines {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {}
                _ => {
                    self.partial.extend_from_slice(&[byte]);
                    if self.partial.len() >= MAX_CONSOLE_LINE {
                        lines.push(self.take_line());
                    }
                }
            }
        }
        lines
    }

    fn take_line(&mut self) -> String {
        let line = self.partial.split();
        String::from_utf8_lossy(&line).into_owned()
    }
}

enum Exit {
    Stopped,
    Lost(String),
}

/// Handle to a running reader thread.
pub(crate) struct ReaderHandle {
    stop: Arc<StopSignal>,
    exited: Completion<()>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    /// Starts the reader for an established link.
    pub(crate) fn spawn(link: Arc<Link>) -> Result<Self> {
        let stop = Arc::new(StopSignal::new());
        let exited = Completion::new();

        let thread_stop = Arc::clone(&stop);
        let thread_exited = exited.clone();
        let thread = thread::Builder::new()
            .name("meshlink-reader".into())
            .spawn(move || {
                run(&link, &thread_stop);
                thread_exited.complete(());
            })?;

        Ok(Self {
            stop,
            exited,
            thread,
        })
    }

    /// Asks the thread to stop at its next read boundary.
    pub(crate) fn stop(&self) {
        self.stop.stop();
    }

    /// Returns true once the thread has left its loop.
    pub(crate) fn is_finished(&self) -> bool {
        self.exited.is_done()
    }

    /// Joins the thread, waiting at most `timeout`. Joining from the reader
    /// thread itself (a subscriber closing the link) detaches instead.
    pub(crate) fn join(self, timeout: Duration) {
        if self.thread.thread().id() == thread::current().id() {
            trace!("close called from reader thread; not joining");
            return;
        }
        match self.exited.wait(timeout) {
            WaitOutcome::Ready(()) => {
                if self.thread.join().is_err() {
                    error!("reader thread panicked");
                }
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                warn!(?timeout, "reader thread did not stop in time; detaching");
            }
        }
    }
}

fn run(link: &Link, stop: &StopSignal) {
    debug!(transport = %link.transport.kind(), "reader started");
    loop {
        let reason = match pump(link, stop) {
            Exit::Stopped => break,
            Exit::Lost(reason) => reason,
        };
        link.lose(&reason);

        if stop.is_stopped() {
            break;
        }
        if !link.config.auto_reconnect || !reconnect(link, stop) {
            if !stop.is_stopped() {
                link.session.lock().settle();
                error!("link down; not reconnecting");
            }
            break;
        }
    }
    debug!("reader stopped");
}

/// Reads and dispatches until the link is lost or a stop is requested.
fn pump(link: &Link, stop: &StopSignal) -> Exit {
    let mut decoder = FrameDecoder::new();
    let mut console = ConsoleLines::new();

    loop {
        if stop.is_stopped() {
            return Exit::Stopped;
        }
        if link.link_failed.swap(false, Ordering::SeqCst) {
            return Exit::Lost("write failed".into());
        }

        let bytes = match link.transport.read(link.config.read_timeout) {
            Ok(bytes) => bytes,
            Err(e) => {
                if stop.is_stopped() {
                    return Exit::Stopped;
                }
                warn!("read failed: {}", e);
                return Exit::Lost(e.to_string());
            }
        };

        let now = Instant::now();
        if !bytes.is_empty() {
            trace!("received {} bytes", bytes.len());
            link.session.lock().note_rx(now);
            for decoded in decoder.push(&bytes) {
                match decoded {
                    Decoded::Frame(payload) => link.process_frame(&payload),
                    Decoded::Noise(noise) => {
                        for line in console.push(&noise) {
                            device_log(link, line);
                        }
                    }
                }
            }
        }
        for line in link.transport.take_log_lines() {
            device_log(link, line);
        }

        if let Some(reason) = link.housekeeping(now) {
            return Exit::Lost(reason);
        }
    }
}

fn device_log(link: &Link, line: String) {
    debug!(target: "meshlink::device", "{}", line);
    link.dispatcher.emit(&Event::LogLine(line));
}

/// Retries the link with capped exponential backoff. Returns false when
/// attempts are exhausted or a stop was requested.
fn reconnect(link: &Link, stop: &StopSignal) -> bool {
    let mut attempt = 0u32;
    loop {
        if link
            .config
            .max_reconnect_attempts
            .is_some_and(|max| attempt >= max)
        {
            warn!(attempts = attempt, "giving up reconnecting");
            return false;
        }

        let delay = link.config.backoff_for(attempt);
        info!(attempt = attempt + 1, ?delay, "reconnecting");
        if stop.wait_timeout(delay) {
            return false;
        }

        match link.establish() {
            Ok(()) if stop.is_stopped() => {
                debug!("stopped while reconnecting; releasing transport");
                link.close_transport();
                return false;
            }
            Ok(()) => {
                info!("transport reopened");
                return true;
            }
            Err(e) => warn!(attempt = attempt + 1, "reconnect failed: {}", e),
        }
        attempt = attempt.saturating_add(1);
    }
}
