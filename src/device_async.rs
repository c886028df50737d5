//! Future-style adapter on Tokio
//!
//! `HidDeviceAsync` exposes the same contract as [`HidDevice`](crate::HidDevice)
//! with `async` operations. Blocking handle calls run on Tokio's blocking
//! pool, one at a time and in call order. Reading is driven by a start/stop
//! [`ReadStream`]: the first `Data` listener starts it and removing the last
//! one stops it, both deferred to a task on the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hidstream_transport::{
    BoxedHandle, DeviceDescriptor, DeviceHandle, DeviceSelector, HidBackend, HidapiBackend,
    Report, TransportError,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::error::{HidError, HidResult};
use crate::listeners::{EventKind, HidEvent, Listener, ListenerId, ListenerRegistry, Transition};
use crate::read_loop::{
    read_until, thread_spawn_error, LoopStats, ReadLock, ReadOutcome, ReadStream,
};
use crate::validate::{validate_length, IntoReport};
use crate::{check_selector, AdapterState};

struct AsyncInner {
    name: String,
    handle: BoxedHandle,
    config: AdapterConfig,
    runtime: Handle,
    listeners: ListenerRegistry,
    stream: ReadStream,
    read_lock: ReadLock,
    /// FIFO queue for handle operations
    queue: tokio::sync::Mutex<()>,
    /// Held while deciding to start or stop the stream
    control: Mutex<()>,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// An async HID device with a listener-driven read stream
pub struct HidDeviceAsync {
    inner: Arc<AsyncInner>,
}

impl HidDeviceAsync {
    /// Open a real device through hidapi with default settings
    pub async fn open(selector: &DeviceSelector) -> HidResult<Self> {
        Self::open_with(
            Arc::new(HidapiBackend::new()),
            selector.clone(),
            AdapterConfig::default(),
        )
        .await
    }

    /// Open a device through `backend`
    ///
    /// Must be awaited inside a Tokio runtime; anywhere else this fails with
    /// [`HidError::Construction`].
    pub async fn open_with(
        backend: Arc<dyn HidBackend>,
        selector: DeviceSelector,
        config: AdapterConfig,
    ) -> HidResult<Self> {
        check_selector(&selector)?;
        let runtime = Handle::try_current().map_err(|e| {
            HidError::Construction(format!(
                "HidDeviceAsync must be opened inside a Tokio runtime: {e}"
            ))
        })?;

        let name = selector.to_string();
        let nonblocking = config.nonblocking;
        let handle = runtime
            .spawn_blocking(move || -> Result<BoxedHandle, TransportError> {
                let handle = backend.open(&selector)?;
                if nonblocking {
                    if let Err(e) = handle.set_nonblocking(true) {
                        let _ = handle.close();
                        return Err(e);
                    }
                }
                Ok(handle)
            })
            .await
            .map_err(join_error)?
            .map_err(HidError::Open)?;

        let read_lock = ReadLock::default();
        let stream = ReadStream::new(
            "hidstream",
            Arc::clone(&handle),
            Arc::clone(&read_lock),
            config.read_timeout_ms,
        );
        info!("Opened {}", name);

        Ok(Self {
            inner: Arc::new(AsyncInner {
                name,
                handle,
                config,
                runtime,
                listeners: ListenerRegistry::new(),
                stream,
                read_lock,
                queue: tokio::sync::Mutex::new(()),
                control: Mutex::new(()),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Register a listener for `Data` reports
    ///
    /// Listeners run on the stream thread, not on the runtime.
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

    /// Register a listener for stream errors
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

    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> HidResult<ListenerId> {
        self.ensure_open()?;
        let (id, transition) = self.inner.listeners.add(kind, listener);
        if transition == Transition::FirstData {
            self.schedule_sync();
        }
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        if self.inner.listeners.remove(id) == Transition::LastData {
            self.schedule_sync();
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    /// Start the stream if anyone listens for `Data`
    pub fn resume(&self) {
        let started = {
            let _control = self.inner.control.lock();
            if !self.inner.closing.load(Ordering::SeqCst)
                && self.inner.listeners.count(EventKind::Data) > 0
            {
                self.inner.start_stream()
            } else {
                Ok(())
            }
        };
        if let Err(error) = started {
            self.inner.publish(&HidEvent::Error(error));
        }
    }

    /// Stop the stream
    pub fn pause(&self) {
        let _control = self.inner.control.lock();
        self.inner.stream.stop();
    }

    pub fn state(&self) -> AdapterState {
        if self.inner.closed.load(Ordering::SeqCst) {
            AdapterState::Closed
        } else if self.inner.closing.load(Ordering::SeqCst) {
            AdapterState::Closing
        } else if self.inner.stream.is_running() {
            AdapterState::Active
        } else {
            AdapterState::Idle
        }
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.inner.stream.stats()
    }

    /// Read one input report
    ///
    /// Waits at most `timeout` (forever if `None`) and returns `None` if it
    /// passes without data. Fails with [`HidError::ReadInProgress`] while
    /// the stream is running.
    pub async fn read(&self, timeout: Option<Duration>) -> HidResult<Option<Report>> {
        self.ensure_readable()?;
        let _turn = self.inner.queue.lock().await;
        self.ensure_readable()?;

        let inner = Arc::clone(&self.inner);
        // Past the end of the clock means no deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let outcome = self
            .inner
            .runtime
            .spawn_blocking(move || {
                let _guard = inner.read_lock.lock();
                read_until(
                    inner.handle.as_ref(),
                    inner.config.read_timeout_ms,
                    deadline,
                    &|| inner.closing.load(Ordering::SeqCst),
                )
            })
            .await
            .map_err(join_error)?;

        match outcome {
            ReadOutcome::Report(report) => {
                debug!("Read {} bytes from {}", report.len(), self.inner.name);
                Ok(Some(report))
            }
            ReadOutcome::TimedOut => Ok(None),
            ReadOutcome::Cancelled => Err(HidError::Closed),
            ReadOutcome::Failed(_) if self.inner.closing.load(Ordering::SeqCst) => {
                Err(HidError::Closed)
            }
            ReadOutcome::Failed(e) => Err(e.into()),
        }
    }

    /// Write an output report, returning the number of bytes accepted
    pub async fn write<D: IntoReport>(&self, data: D) -> HidResult<usize> {
        self.ensure_open()?;
        let report = data.into_report()?;
        let len = report.len();
        let written = self.run(move |handle| handle.write(&report)).await?;
        debug!("Wrote {}/{} bytes to {}", written, len, self.inner.name);
        Ok(written)
    }

    /// Get a feature report; `length` includes the report ID byte
    pub async fn get_feature_report(&self, report_id: u8, length: usize) -> HidResult<Report> {
        self.ensure_open()?;
        let length = validate_length(length)?;
        self.run(move |handle| handle.get_feature_report(report_id, length))
            .await
    }

    /// Send a feature report (report ID in the first byte)
    pub async fn send_feature_report<D: IntoReport>(&self, data: D) -> HidResult<usize> {
        self.ensure_open()?;
        let report = data.into_report()?;
        self.run(move |handle| handle.send_feature_report(&report))
            .await
    }

    pub async fn set_nonblocking(&self, nonblocking: bool) -> HidResult<()> {
        self.run(move |handle| handle.set_nonblocking(nonblocking))
            .await
    }

    pub async fn device_info(&self) -> HidResult<DeviceDescriptor> {
        self.run(|handle| handle.device_info()).await
    }

    /// Close the device
    ///
    /// Removes all listeners, stops the stream and releases the handle on
    /// the blocking pool. Does not wait for queued operations. Closing twice
    /// fails with [`HidError::Closed`].
    pub async fn close(&self) -> HidResult<()> {
        if !self.inner.begin_close() {
            return Err(HidError::Closed);
        }
        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .runtime
            .spawn_blocking(move || inner.handle.close())
            .await;
        self.inner.closed.store(true, Ordering::SeqCst);
        info!("Closed {}", self.inner.name);
        result.map_err(join_error)?.map_err(HidError::from)
    }

    /// Run a handle operation on the blocking pool, after every earlier one
    async fn run<T, F>(&self, op: F) -> HidResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DeviceHandle) -> Result<T, TransportError> + Send + 'static,
    {
        self.ensure_open()?;
        let _turn = self.inner.queue.lock().await;
        // Closed while waiting for our turn
        self.ensure_open()?;

        let handle = Arc::clone(&self.inner.handle);
        let result = self
            .inner
            .runtime
            .spawn_blocking(move || op(handle.as_ref()))
            .await
            .map_err(join_error)?;
        Ok(result?)
    }

    fn schedule_sync(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.sync_with_listeners();
        });
    }

    fn ensure_open(&self) -> HidResult<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(HidError::Closed);
        }
        Ok(())
    }

    fn ensure_readable(&self) -> HidResult<()> {
        self.ensure_open()?;
        if self.inner.stream.is_running() {
            return Err(HidError::ReadInProgress);
        }
        Ok(())
    }
}

impl Drop for HidDeviceAsync {
    fn drop(&mut self) {
        if self.inner.begin_close() {
            // No runtime to await on here; the handle close is brief
            if let Err(e) = self.inner.handle.close() {
                debug!("Close on drop of {} failed: {}", self.inner.name, e);
            }
            self.inner.closed.store(true, Ordering::SeqCst);
        }
    }
}

impl AsyncInner {
    /// Start or stop the stream to match the current `Data` listener count
    fn sync_with_listeners(self: &Arc<Self>) {
        let started = {
            let _control = self.control.lock();
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if self.listeners.count(EventKind::Data) > 0 {
                self.start_stream()
            } else {
                self.stream.stop();
                Ok(())
            }
        };
        if let Err(error) = started {
            self.publish(&HidEvent::Error(error));
        }
    }

    /// Caller holds `control` and publishes a returned error after
    /// releasing it
    fn start_stream(self: &Arc<Self>) -> HidResult<()> {
        let on_report = {
            let inner = Arc::downgrade(self);
            move |report: Report| {
                if let Some(inner) = inner.upgrade() {
                    inner.publish(&HidEvent::Data(report));
                }
            }
        };
        let on_error = {
            let inner = Arc::downgrade(self);
            move |e: TransportError| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if inner.closing.load(Ordering::SeqCst) {
                    debug!("Stream error on {} while closing ignored: {}", inner.name, e);
                } else {
                    warn!("Read stream of {} stopped: {}", inner.name, e);
                    inner.publish(&HidEvent::Error(e.into()));
                }
            }
        };

        self.stream.start(on_report, on_error).map_err(|e| {
            let error = thread_spawn_error(e);
            warn!("Cannot start read stream of {}: {}", self.name, error);
            error
        })?;
        Ok(())
    }

    fn publish(&self, event: &HidEvent) {
        self.listeners
            .publish(event, &|| self.closing.load(Ordering::SeqCst));
    }

    /// Set the closing flag, drop listeners and stop the stream. Returns
    /// false if the device was already closing.
    fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let removed = self.listeners.clear();
        debug!("Closing {} ({} listeners removed)", self.name, removed);
        let _control = self.control.lock();
        self.stream.stop();
        true
    }
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> HidError {
    HidError::Transport(TransportError::Internal(format!(
        "blocking task failed: {e}"
    )))
}
