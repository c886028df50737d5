//! Read loop primitives
//!
//! Two shapes drive a [`DeviceHandle`]:
//!
//! - [`ReadWorker`]: a worker thread that performs one read per request and
//!   posts the outcome back. The sync adapter re-arms it from its completion
//!   handler.
//! - [`ReadStream`]: a start/stop stream thread that reads continuously and
//!   hands every report to a callback until stopped. Used by the async adapter.
//!
//! Both go through [`read_until`], which splits a long read into bounded
//! transport reads so that cancellation is noticed within one poll interval,
//! and both hold a shared read lock while reading so that reads against one
//! handle never overlap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hidstream_transport::{BoxedHandle, DeviceHandle, Report, TransportError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::HidError;

/// Lock taken around every read of one handle
pub(crate) type ReadLock = Arc<Mutex<()>>;

/// Result of one logical read
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Report(Report),
    /// The deadline passed without data
    TimedOut,
    /// The cancel check fired before data arrived
    Cancelled,
    Failed(TransportError),
}

/// Read until a report arrives, the deadline passes or `cancel` returns true
///
/// Each transport read is bounded by `poll_ms`; `cancel` is checked before
/// every one of them. Without a deadline this only returns on data, error
/// or cancellation.
pub(crate) fn read_until(
    handle: &dyn DeviceHandle,
    poll_ms: i32,
    deadline: Option<Instant>,
    cancel: &dyn Fn() -> bool,
) -> ReadOutcome {
    let poll_ms = poll_ms.max(1);
    loop {
        if cancel() {
            return ReadOutcome::Cancelled;
        }
        let timeout = match deadline {
            None => poll_ms,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now()).as_millis();
                i32::try_from(left).unwrap_or(i32::MAX).min(poll_ms)
            }
        };
        match handle.read_timeout(timeout) {
            Ok(Some(report)) => return ReadOutcome::Report(report),
            Ok(None) if deadline.is_some() && timeout == 0 => return ReadOutcome::TimedOut,
            Ok(None) => {}
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

/// Error for a read loop thread that could not be spawned
pub(crate) fn thread_spawn_error(e: std::io::Error) -> HidError {
    HidError::Transport(TransportError::Internal(format!(
        "cannot spawn read loop thread: {e}"
    )))
}

/// Start/stop counters of a read loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Number of Idle -> Active transitions
    pub starts: u64,
    /// Number of Active -> Idle transitions (explicit, last listener gone, or error)
    pub stops: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LoopCounters {
    starts: AtomicU64,
    stops: AtomicU64,
}

impl LoopCounters {
    pub(crate) fn started(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn stopped(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> LoopStats {
        LoopStats {
            starts: self.starts.load(Ordering::SeqCst),
            stops: self.stops.load(Ordering::SeqCst),
        }
    }
}

/// Cancellation check evaluated by the worker between bounded reads
pub(crate) type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// One-read-per-request worker thread
///
/// After `start`, every `request()` makes the worker run one [`read_until`]
/// and send the outcome on its completion channel. The thread exits when the
/// worker is shut down or the completion receiver is gone.
pub(crate) struct ReadWorker {
    request_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl ReadWorker {
    pub(crate) fn new() -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        Self {
            request_tx: Mutex::new(Some(request_tx)),
            request_rx: Mutex::new(Some(request_rx)),
        }
    }

    /// Spawn the worker thread. Calling it again is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start<T, F>(
        &self,
        name: &str,
        handle: BoxedHandle,
        read_lock: ReadLock,
        poll_ms: i32,
        cancel: CancelCheck,
        completion_tx: mpsc::UnboundedSender<T>,
        wrap: F,
    ) -> std::io::Result<()>
    where
        T: Send + 'static,
        F: Fn(ReadOutcome) -> T + Send + 'static,
    {
        let Some(mut request_rx) = self.request_rx.lock().take() else {
            return Ok(());
        };
        std::thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || {
                debug!("Read worker started");
                while request_rx.blocking_recv().is_some() {
                    let outcome = {
                        let _guard = read_lock.lock();
                        read_until(handle.as_ref(), poll_ms, None, cancel.as_ref())
                    };
                    if completion_tx.send(wrap(outcome)).is_err() {
                        break;
                    }
                }
                debug!("Read worker exiting");
            })?;
        Ok(())
    }

    /// Ask for one more read. Returns false once the worker is shut down.
    pub(crate) fn request(&self) -> bool {
        match self.request_tx.lock().as_ref() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Let the thread exit after its current read
    pub(crate) fn shutdown(&self) {
        self.request_tx.lock().take();
        self.request_rx.lock().take();
    }
}

/// Continuous start/stop read stream
///
/// `start` and `stop` are idempotent. A stream that hits a transport error
/// reports it once through `on_error` and stops by itself; a later `start`
/// spawns a fresh thread.
pub(crate) struct ReadStream {
    name: String,
    handle: BoxedHandle,
    read_lock: ReadLock,
    poll_ms: i32,
    /// Run flag of the current stream thread, if one was started
    running: Mutex<Option<Arc<AtomicBool>>>,
    counters: Arc<LoopCounters>,
}

impl ReadStream {
    pub(crate) fn new(name: &str, handle: BoxedHandle, read_lock: ReadLock, poll_ms: i32) -> Self {
        Self {
            name: name.to_string(),
            handle,
            read_lock,
            poll_ms,
            running: Mutex::new(None),
            counters: Arc::new(LoopCounters::default()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.load(Ordering::SeqCst))
    }

    pub(crate) fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// Start streaming; returns `Ok(false)` if already running
    pub(crate) fn start<R, E>(&self, on_report: R, on_error: E) -> std::io::Result<bool>
    where
        R: Fn(Report) + Send + 'static,
        E: FnOnce(TransportError) + Send + 'static,
    {
        let mut current = self.running.lock();
        if current
            .as_ref()
            .is_some_and(|running| running.load(Ordering::SeqCst))
        {
            return Ok(false);
        }

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = Arc::clone(&self.handle);
        let read_lock = Arc::clone(&self.read_lock);
        let counters = Arc::clone(&self.counters);
        let poll_ms = self.poll_ms;

        std::thread::Builder::new()
            .name(format!("{}-stream", self.name))
            .spawn(move || {
                run_stream(
                    handle,
                    read_lock,
                    poll_ms,
                    thread_running,
                    counters,
                    on_report,
                    on_error,
                )
            })?;

        self.counters.started();
        *current = Some(running);
        debug!("{} stream started", self.name);
        Ok(true)
    }

    /// Stop streaming; returns false if it was not running
    ///
    /// Does not wait for the stream thread. A read in progress finishes
    /// within one poll interval and its result is discarded.
    pub(crate) fn stop(&self) -> bool {
        let current = self.running.lock();
        let stopped = current
            .as_ref()
            .is_some_and(|running| running.swap(false, Ordering::SeqCst));
        if stopped {
            self.counters.stopped();
            debug!("{} stream stopped", self.name);
        }
        stopped
    }
}

fn run_stream<R, E>(
    handle: BoxedHandle,
    read_lock: ReadLock,
    poll_ms: i32,
    running: Arc<AtomicBool>,
    counters: Arc<LoopCounters>,
    on_report: R,
    on_error: E,
) where
    R: Fn(Report),
    E: FnOnce(TransportError),
{
    debug!("Stream thread started");
    let cancel = || !running.load(Ordering::SeqCst);

    loop {
        let outcome = {
            let _guard = read_lock.lock();
            read_until(handle.as_ref(), poll_ms, None, &cancel)
        };
        match outcome {
            ReadOutcome::Report(report) => {
                if cancel() {
                    debug!("Dropping {} byte report read after stop", report.len());
                    break;
                }
                on_report(report);
            }
            ReadOutcome::Failed(e) => {
                // Whoever clears the flag first owns the stop
                if running.swap(false, Ordering::SeqCst) {
                    counters.stopped();
                    on_error(e);
                } else {
                    debug!("Read error after stop ignored: {}", e);
                }
                break;
            }
            ReadOutcome::Cancelled | ReadOutcome::TimedOut => break,
        }
    }
    debug!("Stream thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hidstream_transport::MockDevice;
    use std::time::Duration;

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_read_until_deadline() {
        let dev = MockDevice::new("mock0");
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        assert_eq!(
            read_until(dev.as_ref(), 5, deadline, &|| false),
            ReadOutcome::TimedOut
        );

        dev.feed(vec![7]);
        assert_eq!(
            read_until(dev.as_ref(), 5, None, &|| false),
            ReadOutcome::Report(vec![7])
        );
    }

    #[test]
    fn test_read_until_cancel_and_error() {
        let dev = MockDevice::new("mock0");
        assert_eq!(
            read_until(dev.as_ref(), 5, None, &|| true),
            ReadOutcome::Cancelled
        );
        assert_eq!(dev.read_calls(), 0);

        dev.fail_read(TransportError::Disconnected);
        assert_eq!(
            read_until(dev.as_ref(), 5, None, &|| false),
            ReadOutcome::Failed(TransportError::Disconnected)
        );
    }

    #[test]
    fn test_worker_reads_on_request() {
        let dev = MockDevice::new("mock0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = ReadWorker::new();
        worker
            .start(
                "test",
                dev.clone(),
                ReadLock::default(),
                5,
                Arc::new(|| false),
                tx,
                |outcome| outcome,
            )
            .unwrap();

        // Nothing is read before the first request
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dev.read_calls(), 0);

        dev.feed(vec![1, 2]);
        assert!(worker.request());
        assert_eq!(rx.blocking_recv(), Some(ReadOutcome::Report(vec![1, 2])));

        worker.shutdown();
        assert!(!worker.request());
    }

    #[test]
    fn test_stream_start_stop_idempotent() {
        let dev = MockDevice::new("mock0");
        let stream = ReadStream::new("test", dev.clone(), ReadLock::default(), 5);
        let reports = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&reports);
        assert!(stream.start(move |r| sink.lock().push(r), |_| {}).unwrap());
        assert!(!stream.start(|_| {}, |_| {}).unwrap());
        assert!(stream.is_running());

        dev.feed(vec![1]);
        dev.feed(vec![2]);
        wait_for("two reports", || reports.lock().len() == 2);
        assert_eq!(*reports.lock(), vec![vec![1], vec![2]]);

        assert!(stream.stop());
        assert!(!stream.stop());
        assert_eq!(stream.stats(), LoopStats { starts: 1, stops: 1 });
    }

    #[test]
    fn test_stream_error_stops_once() {
        let dev = MockDevice::new("mock0");
        let stream = ReadStream::new("test", dev.clone(), ReadLock::default(), 5);
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&errors);
        stream.start(|_| {}, move |e| sink.lock().push(e)).unwrap();
        dev.fail_read(TransportError::Disconnected);

        wait_for("stream to stop", || !stream.is_running());
        assert_eq!(*errors.lock(), vec![TransportError::Disconnected]);
        assert_eq!(stream.stats(), LoopStats { starts: 1, stops: 1 });
        // Already stopped by the error
        assert!(!stream.stop());
    }
}
