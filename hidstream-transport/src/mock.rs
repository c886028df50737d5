//! In-memory mock transport
//!
//! `MockDevice` plays back reports and errors fed to it in order, records
//! everything written to it and counts calls into each primitive. It is used
//! by the adapter test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::TransportError;
use crate::types::{DeviceDescriptor, DeviceSelector, Report};
use crate::{BoxedHandle, DeviceHandle, HidBackend};

/// pid.codes test vendor ID used for mock devices
pub const MOCK_VENDOR_ID: u16 = 0x1209;
/// Product ID used for mock devices
pub const MOCK_PRODUCT_ID: u16 = 0x0001;

#[derive(Default)]
struct MockState {
    /// Pending results for `read_timeout`, oldest first
    queue: VecDeque<Result<Report, TransportError>>,
    closed: bool,
    nonblocking: bool,
    feature_reports: HashMap<u8, Report>,
    write_error: Option<TransportError>,
    // Call log
    read_calls: usize,
    reads_in_flight: usize,
    max_concurrent_reads: usize,
    writes: Vec<Report>,
    sent_feature_reports: Vec<Report>,
    close_calls: usize,
}

/// A scriptable in-memory HID device
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    state: Mutex<MockState>,
    data_ready: Condvar,
}

impl MockDevice {
    /// Create a mock device with the given path and default test IDs
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Self::with_descriptor(DeviceDescriptor {
            vendor_id: MOCK_VENDOR_ID,
            product_id: MOCK_PRODUCT_ID,
            path: path.into(),
            manufacturer: Some("hidstream".into()),
            product: Some("Mock HID device".into()),
            release: 0x0100,
            interface: 0,
            ..Default::default()
        })
    }

    pub fn with_descriptor(descriptor: DeviceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            state: Mutex::new(MockState::default()),
            data_ready: Condvar::new(),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Queue an input report for the next read
    pub fn feed(&self, report: impl Into<Report>) {
        self.state.lock().queue.push_back(Ok(report.into()));
        self.data_ready.notify_all();
    }

    /// Queue a read failure; reads resume normally after it is consumed
    pub fn fail_read(&self, error: TransportError) {
        self.state.lock().queue.push_back(Err(error));
        self.data_ready.notify_all();
    }

    /// Make every following write fail with `error` (`None` restores writes)
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state.lock().write_error = error;
    }

    /// Preload the feature report returned for `report_id`
    pub fn set_feature_report(&self, report_id: u8, report: impl Into<Report>) {
        self.state
            .lock()
            .feature_reports
            .insert(report_id, report.into());
    }

    /// Number of calls into `read_timeout`
    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }

    /// Highest number of reads that were blocked in the device at once
    pub fn max_concurrent_reads(&self) -> usize {
        self.state.lock().max_concurrent_reads
    }

    /// Reports queued but not read yet
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Output reports written so far
    pub fn writes(&self) -> Vec<Report> {
        self.state.lock().writes.clone()
    }

    /// Feature reports sent so far
    pub fn sent_feature_reports(&self) -> Vec<Report> {
        self.state.lock().sent_feature_reports.clone()
    }

    /// Number of calls into `close`, including failed ones
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn is_nonblocking(&self) -> bool {
        self.state.lock().nonblocking
    }

    /// Mark the device open again (a new session on the same device)
    fn reopen(&self) {
        self.state.lock().closed = false;
    }
}

impl DeviceHandle for MockDevice {
    fn read_timeout(&self, timeout_ms: i32) -> Result<Option<Report>, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.read_calls += 1;
        state.reads_in_flight += 1;
        state.max_concurrent_reads = state.max_concurrent_reads.max(state.reads_in_flight);

        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let result = loop {
            if let Some(item) = state.queue.pop_front() {
                break item.map(Some);
            }
            if state.closed {
                // Device went away underneath a pending read
                break Err(TransportError::Disconnected);
            }
            if timeout_ms == 0 || (timeout_ms < 0 && state.nonblocking) {
                break Ok(None);
            }
            match deadline {
                Some(deadline) => {
                    if self.data_ready.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                        && !state.closed
                    {
                        break Ok(None);
                    }
                }
                None => self.data_ready.wait(&mut state),
            }
        };

        state.reads_in_flight -= 1;
        result
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(err) = state.write_error.clone() {
            return Err(err);
        }
        state.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn get_feature_report(&self, report_id: u8, length: usize) -> Result<Report, TransportError> {
        let state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let mut report = state.feature_reports.get(&report_id).cloned().ok_or_else(|| {
            TransportError::HidError(format!("no feature report with ID {report_id}"))
        })?;
        report.truncate(length);
        Ok(report)
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.sent_feature_reports.push(data.to_vec());
        Ok(data.len())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.nonblocking = nonblocking;
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceDescriptor, TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(self.descriptor.clone())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.closed = true;
        drop(state);
        // Wake any blocked reader so it observes the close
        self.data_ready.notify_all();
        debug!("Mock device {} closed", self.descriptor.path);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Backend serving a fixed set of mock devices
#[derive(Default)]
pub struct MockBackend {
    devices: Mutex<Vec<Arc<MockDevice>>>,
    open_error: Mutex<Option<TransportError>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mock device with the given path and return it for scripting
    pub fn add_device(&self, path: impl Into<String>) -> Arc<MockDevice> {
        let device = MockDevice::new(path);
        self.insert(Arc::clone(&device));
        device
    }

    pub fn insert(&self, device: Arc<MockDevice>) {
        self.devices.lock().push(device);
    }

    /// Make every following `open` fail with `error` (`None` restores opening)
    pub fn fail_open(&self, error: Option<TransportError>) {
        *self.open_error.lock() = error;
    }
}

impl HidBackend for MockBackend {
    fn list_devices(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| d.descriptor.clone())
            .filter(|d| d.matches(vendor_id, product_id))
            .collect())
    }

    fn open(&self, selector: &DeviceSelector) -> Result<BoxedHandle, TransportError> {
        if let Some(err) = self.open_error.lock().clone() {
            return Err(err);
        }
        let device = self
            .devices
            .lock()
            .iter()
            .find(|d| selector.matches(&d.descriptor))
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(selector.to_string()))?;
        device.reopen();
        Ok(device)
    }
}
