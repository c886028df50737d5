//! Synchronous-handle adapter
//!
//! `HidDevice` owns one [`DeviceHandle`](hidstream_transport::DeviceHandle)
//! and two background threads:
//!
//! - the event thread, which runs deferred resumes and read completions one
//!   at a time and publishes events to listeners
//! - the read worker, which performs one bounded-poll read per request
//!
//! A completed read re-arms the worker (if the loop should keep running)
//! before its report is published, so a listener that pauses or closes the
//! device from inside its callback already sees the next read in flight and
//! cancels it. The last `Data` listener going away is not signalled
//! directly; the worker's cancel check and the completion handler notice it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hidstream_transport::{
    BoxedHandle, DeviceDescriptor, DeviceSelector, HidBackend, HidapiBackend, Report,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::error::{HidError, HidResult};
use crate::listeners::{EventKind, HidEvent, Listener, ListenerId, ListenerRegistry, Transition};
use crate::read_loop::{
    read_until, thread_spawn_error, LoopCounters, LoopStats, ReadLock, ReadOutcome, ReadWorker,
};
use crate::validate::{validate_length, IntoReport};
use crate::{check_selector, AdapterState};

/// Work items for the event thread
enum Task {
    /// Deferred resume after the first `Data` listener was added
    Resume,
    /// A read issued by the worker finished
    Completed(ReadOutcome),
}

#[derive(Debug)]
struct LoopState {
    paused: bool,
    /// A read has been requested and its completion not handled yet
    in_flight: bool,
}

struct Inner {
    name: String,
    handle: BoxedHandle,
    config: AdapterConfig,
    listeners: ListenerRegistry,
    state: Mutex<LoopState>,
    counters: LoopCounters,
    closing: AtomicBool,
    closed: AtomicBool,
    read_lock: ReadLock,
    worker: ReadWorker,
    task_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

/// A HID device with a listener-driven read loop
///
/// Created with [`HidDevice::open`] or [`HidDevice::open_with`]. Dropping
/// an open device closes it.
pub struct HidDevice {
    inner: Arc<Inner>,
}

impl HidDevice {
    /// Open a real device through hidapi with default settings
    pub fn open(selector: &DeviceSelector) -> HidResult<Self> {
        Self::open_with(&HidapiBackend::new(), selector, AdapterConfig::default())
    }

    /// Open a device through `backend`
    pub fn open_with(
        backend: &dyn HidBackend,
        selector: &DeviceSelector,
        config: AdapterConfig,
    ) -> HidResult<Self> {
        check_selector(selector)?;
        let handle = backend.open(selector).map_err(HidError::Open)?;

        if config.nonblocking {
            if let Err(e) = handle.set_nonblocking(true) {
                let _ = handle.close();
                return Err(HidError::Open(e));
            }
        }

        Self::start(handle, selector.to_string(), config)
    }

    fn start(handle: BoxedHandle, name: String, config: AdapterConfig) -> HidResult<Self> {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            name,
            handle: Arc::clone(&handle),
            config,
            listeners: ListenerRegistry::new(),
            state: Mutex::new(LoopState {
                paused: true,
                in_flight: false,
            }),
            counters: LoopCounters::default(),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_lock: ReadLock::default(),
            worker: ReadWorker::new(),
            task_tx: Mutex::new(Some(task_tx.clone())),
        });

        let weak = Arc::downgrade(&inner);
        let spawned = std::thread::Builder::new()
            .name("hidstream-events".into())
            .spawn(move || run_events(weak, task_rx));
        if let Err(e) = spawned {
            let _ = handle.close();
            return Err(thread_spawn_error(e));
        }

        let weak = Arc::downgrade(&inner);
        let started = inner.worker.start(
            "hidstream",
            handle,
            Arc::clone(&inner.read_lock),
            inner.config.read_timeout_ms,
            Arc::new(move || weak.upgrade().map_or(true, |inner| inner.read_cancelled())),
            task_tx,
            Task::Completed,
        );
        let device = Self { inner };
        // Dropping `device` on failure closes the handle and stops the event thread
        started.map_err(thread_spawn_error)?;

        info!("Opened {}", device.inner.name);
        Ok(device)
    }

    /// Register a listener for `Data` reports
    pub fn on_data<F>(&self, f: F) -> HidResult<ListenerId>
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Data,
            Arc::new(move |event: &HidEvent| {
                if let HidEvent::Data(report) = event {
                    f(report)
                }
            }),
        )
    }

    /// Register a listener for read loop errors
    pub fn on_error<F>(&self, f: F) -> HidResult<ListenerId>
    where
        F: Fn(&HidError) + Send + Sync + 'static,
    {
        self.add_listener(
            EventKind::Error,
            Arc::new(move |event: &HidEvent| {
                if let HidEvent::Error(error) = event {
                    f(error)
                }
            }),
        )
    }

    /// Register a listener for `kind`
    ///
    /// Adding the first `Data` listener schedules a resume on the event
    /// thread rather than starting the loop inside this call.
    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> HidResult<ListenerId> {
        self.ensure_open()?;
        let (id, transition) = self.inner.listeners.add(kind, listener);
        if transition == Transition::FirstData {
            self.inner.post(Task::Resume);
        }
        Ok(id)
    }

    /// Remove a listener. Removing the last `Data` listener stops the loop
    /// within one read iteration.
    pub fn remove_listener(&self, id: ListenerId) {
        if self.inner.listeners.remove(id) == Transition::LastData {
            debug!("Last data listener removed from {}", self.inner.name);
        }
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    /// Start the read loop if anyone listens for `Data`
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stop the read loop; a read in flight is cancelled at its next poll
    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn state(&self) -> AdapterState {
        self.inner.state()
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.inner.counters.snapshot()
    }

    /// Block until the next input report arrives
    ///
    /// Fails with [`HidError::ReadInProgress`] while the read loop is active.
    pub fn read(&self) -> HidResult<Report> {
        self.read_once(None)?
            .ok_or(HidError::Transport(TransportError::Timeout))
    }

    /// Read one input report, waiting at most `timeout_ms`
    ///
    /// A negative timeout blocks like [`read`](Self::read). Returns `None`
    /// when the timeout passes without data.
    pub fn read_timeout(&self, timeout_ms: i32) -> HidResult<Option<Report>> {
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        self.read_once(deadline)
    }

    fn read_once(&self, deadline: Option<Instant>) -> HidResult<Option<Report>> {
        self.ensure_open()?;
        if self.state() == AdapterState::Active {
            return Err(HidError::ReadInProgress);
        }

        let inner = &self.inner;
        let closing = || inner.closing.load(Ordering::SeqCst);
        let outcome = {
            let _guard = inner.read_lock.lock();
            read_until(
                inner.handle.as_ref(),
                inner.config.read_timeout_ms,
                deadline,
                &closing,
            )
        };
        match outcome {
            ReadOutcome::Report(report) => {
                debug!("Read {} bytes from {}", report.len(), inner.name);
                Ok(Some(report))
            }
            ReadOutcome::TimedOut => Ok(None),
            ReadOutcome::Cancelled => Err(HidError::Closed),
            ReadOutcome::Failed(_) if closing() => Err(HidError::Closed),
            ReadOutcome::Failed(e) => Err(e.into()),
        }
    }

    /// Write an output report, returning the number of bytes accepted
    ///
    /// `data` is validated before the transport sees it.
    pub fn write<D: IntoReport>(&self, data: D) -> HidResult<usize> {
        self.ensure_open()?;
        let report = data.into_report()?;
        let written = self.inner.handle.write(&report)?;
        debug!("Wrote {}/{} bytes to {}", written, report.len(), self.inner.name);
        Ok(written)
    }

    /// Get a feature report; `length` includes the report ID byte
    pub fn get_feature_report(&self, report_id: u8, length: usize) -> HidResult<Report> {
        self.ensure_open()?;
        let length = validate_length(length)?;
        Ok(self.inner.handle.get_feature_report(report_id, length)?)
    }

    /// Send a feature report (report ID in the first byte)
    pub fn send_feature_report<D: IntoReport>(&self, data: D) -> HidResult<usize> {
        self.ensure_open()?;
        let report = data.into_report()?;
        Ok(self.inner.handle.send_feature_report(&report)?)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> HidResult<()> {
        self.ensure_open()?;
        Ok(self.inner.handle.set_nonblocking(nonblocking)?)
    }

    pub fn device_info(&self) -> HidResult<DeviceDescriptor> {
        self.ensure_open()?;
        Ok(self.inner.handle.device_info()?)
    }

    /// Close the device
    ///
    /// Removes all listeners, stops the loop and releases the handle. The
    /// handle is marked closed even if releasing it fails. Closing twice
    /// fails with [`HidError::Closed`].
    pub fn close(&self) -> HidResult<()> {
        self.inner.close()
    }

    fn ensure_open(&self) -> HidResult<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(HidError::Closed);
        }
        Ok(())
    }
}

impl Drop for HidDevice {
    fn drop(&mut self) {
        if !self.inner.closing.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.close() {
                debug!("Close on drop of {} failed: {}", self.inner.name, e);
            }
        }
    }
}

impl Inner {
    fn post(&self, task: Task) {
        if let Some(tx) = self.task_tx.lock().as_ref() {
            let _ = tx.send(task);
        }
    }

    /// Checked by the worker before every bounded read
    fn read_cancelled(&self) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return true;
        }
        let paused = self.state.lock().paused;
        paused || self.listeners.count(EventKind::Data) == 0
    }

    fn state(&self) -> AdapterState {
        if self.closed.load(Ordering::SeqCst) {
            AdapterState::Closed
        } else if self.closing.load(Ordering::SeqCst) {
            AdapterState::Closing
        } else if self.state.lock().paused {
            AdapterState::Idle
        } else {
            AdapterState::Active
        }
    }

    fn resume(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if !state.paused || self.listeners.count(EventKind::Data) == 0 {
            return;
        }
        state.paused = false;
        self.counters.started();
        debug!("Read loop of {} resumed", self.name);
        if !state.in_flight {
            state.in_flight = self.worker.request();
        }
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        self.halt(&mut state);
    }

    fn halt(&self, state: &mut LoopState) {
        if !state.paused {
            state.paused = true;
            self.counters.stopped();
            debug!("Read loop of {} paused", self.name);
        }
    }

    /// Handle a finished read: decide about the next read, then publish
    fn complete(&self, outcome: ReadOutcome) {
        let closing = self.closing.load(Ordering::SeqCst);
        let was_active;
        {
            let mut state = self.state.lock();
            state.in_flight = false;
            was_active = !state.paused;

            if matches!(outcome, ReadOutcome::Failed(_))
                || self.listeners.count(EventKind::Data) == 0
            {
                self.halt(&mut state);
            } else if !state.paused && !closing {
                state.in_flight = self.worker.request();
            }
        }

        match outcome {
            ReadOutcome::Report(report) => {
                debug!("Read {} bytes from {}", report.len(), self.name);
                self.publish(&HidEvent::Data(report));
            }
            ReadOutcome::Failed(e) if closing || !was_active => {
                debug!("Read error on {} while stopping ignored: {}", self.name, e);
            }
            ReadOutcome::Failed(e) => {
                warn!("Read loop of {} stopped: {}", self.name, e);
                self.publish(&HidEvent::Error(e.into()));
            }
            ReadOutcome::Cancelled | ReadOutcome::TimedOut => {}
        }
    }

    fn publish(&self, event: &HidEvent) {
        self.listeners
            .publish(event, &|| self.closing.load(Ordering::SeqCst));
    }

    fn close(&self) -> HidResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(HidError::Closed);
        }
        let removed = self.listeners.clear();
        debug!("Closing {} ({} listeners removed)", self.name, removed);

        self.pause();
        self.worker.shutdown();
        self.task_tx.lock().take();

        let result = self.handle.close();
        self.closed.store(true, Ordering::SeqCst);
        info!("Closed {}", self.name);
        result.map_err(HidError::from)
    }
}

fn run_events(inner: Weak<Inner>, mut tasks: mpsc::UnboundedReceiver<Task>) {
    debug!("Event thread started");
    while let Some(task) = tasks.blocking_recv() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match task {
            Task::Resume => inner.resume(),
            Task::Completed(outcome) => inner.complete(outcome),
        }
    }
    debug!("Event thread exiting");
}
