//! Integration tests for the synchronous adapter against the mock transport.
//!
//! These drive `HidDevice` through its whole lifecycle: subscription-driven
//! start/stop of the read loop, event ordering, validation and close.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{config, wait_for, zeros, Recorder, QUIET};
use hidstream::{
    AdapterConfig, AdapterState, DeviceHandle, DeviceSelector, EventKind, HidDevice, HidError,
    HidEvent, LoopStats, MockBackend, MockDevice, TransportError, ValidationError,
};
use serde_json::json;

fn open_mock() -> (MockBackend, Arc<MockDevice>, HidDevice) {
    let backend = MockBackend::new();
    let mock = backend.add_device("mock0");
    let device = HidDevice::open_with(&backend, &DeviceSelector::path("mock0"), config()).unwrap();
    (backend, mock, device)
}

// ── Subscription drives the read loop ──

#[test]
fn no_reads_before_first_data_listener() {
    let (_backend, mock, device) = open_mock();

    // An error listener alone does not start anything
    device.on_error(|_| {}).unwrap();
    mock.feed(vec![1, 2]);
    std::thread::sleep(QUIET);

    assert_eq!(mock.read_calls(), 0);
    assert_eq!(mock.pending(), 1);
    assert_eq!(device.state(), AdapterState::Idle);
    assert_eq!(device.loop_stats(), LoopStats::default());
}

#[test]
fn one_start_and_one_stop_per_listener_edge() {
    let (_backend, mock, device) = open_mock();

    let first = device.on_data(|_| {}).unwrap();
    let second = device.on_data(|_| {}).unwrap();
    wait_for("loop to start reading", || mock.read_calls() > 0);
    assert_eq!(device.state(), AdapterState::Active);

    device.remove_listener(first);
    std::thread::sleep(QUIET);
    assert_eq!(device.state(), AdapterState::Active);

    device.remove_listener(second);
    wait_for("loop to stop", || device.state() == AdapterState::Idle);
    assert_eq!(device.loop_stats(), LoopStats { starts: 1, stops: 1 });

    // Stopped means stopped: no more reads are issued
    std::thread::sleep(QUIET);
    let calls = mock.read_calls();
    std::thread::sleep(QUIET);
    assert_eq!(mock.read_calls(), calls);
    assert_eq!(mock.max_concurrent_reads(), 1);
}

#[test]
fn pause_and_resume_are_idempotent() {
    let (_backend, _mock, device) = open_mock();

    // Nothing to resume for
    device.resume();
    assert_eq!(device.state(), AdapterState::Idle);

    device.on_data(|_| {}).unwrap();
    wait_for("loop to start", || device.state() == AdapterState::Active);
    device.resume();
    device.resume();

    device.pause();
    device.pause();
    assert_eq!(device.state(), AdapterState::Idle);
    assert_eq!(device.loop_stats(), LoopStats { starts: 1, stops: 1 });

    device.resume();
    assert_eq!(device.state(), AdapterState::Active);
    assert_eq!(device.loop_stats(), LoopStats { starts: 2, stops: 1 });
}

// ── Event delivery ──

#[test]
fn reports_then_error_then_silence() {
    let (_backend, mock, device) = open_mock();
    mock.feed(vec![1]);
    mock.feed(vec![2, 2]);
    mock.feed(vec![3, 3, 3]);
    mock.fail_read(TransportError::Disconnected);

    let recorder = Recorder::new();
    device.add_listener(EventKind::Error, recorder.listener()).unwrap();
    device.add_listener(EventKind::Data, recorder.listener()).unwrap();

    wait_for("four events", || recorder.len() == 4);
    std::thread::sleep(QUIET);
    assert_eq!(
        recorder.events(),
        vec![
            HidEvent::Data(vec![1]),
            HidEvent::Data(vec![2, 2]),
            HidEvent::Data(vec![3, 3, 3]),
            HidEvent::Error(HidError::Transport(TransportError::Disconnected)),
        ]
    );
    assert_eq!(device.state(), AdapterState::Idle);
    assert_eq!(device.loop_stats(), LoopStats { starts: 1, stops: 1 });

    // No automatic retry after the error
    mock.feed(vec![4]);
    std::thread::sleep(QUIET);
    assert_eq!(recorder.len(), 4);

    // Explicit resume picks up where the device is
    device.resume();
    wait_for("fifth event", || recorder.len() == 5);
    assert_eq!(recorder.events()[4], HidEvent::Data(vec![4]));
}

#[test]
fn mock0_zero_chunks_scenario() {
    let (_backend, mock, device) = open_mock();
    let recorder = Recorder::new();
    let id = device.add_listener(EventKind::Data, recorder.listener()).unwrap();

    for _ in 0..3 {
        mock.feed(zeros(8));
    }
    wait_for("three reports", || recorder.len() == 3);
    assert_eq!(recorder.events(), vec![HidEvent::Data(zeros(8)); 3]);

    device.remove_listener(id);
    mock.feed(zeros(8));
    std::thread::sleep(QUIET);
    assert_eq!(recorder.len(), 3);
}

#[test]
fn panicking_listener_becomes_error_event() {
    let (_backend, mock, device) = open_mock();
    let errors = Recorder::new();
    device.add_listener(EventKind::Error, errors.listener()).unwrap();

    device
        .on_data(|report| {
            if report[0] == 1 {
                panic!("listener bug");
            }
        })
        .unwrap();
    let good = Recorder::new();
    device.add_listener(EventKind::Data, good.listener()).unwrap();

    mock.feed(vec![1]);
    mock.feed(vec![2]);
    wait_for("both reports", || good.len() == 2);

    assert_eq!(
        errors.events(),
        vec![HidEvent::Error(HidError::ListenerPanicked("listener bug".into()))]
    );
    assert_eq!(device.state(), AdapterState::Active);
}

// ── Writes and one-shot operations ──

#[test]
fn write_forwards_valid_bytes_only() {
    let (_backend, mock, device) = open_mock();

    assert_eq!(device.write(vec![0u8, 17, 255]).unwrap(), 3);
    assert_eq!(device.write(vec![1i32, 2]).unwrap(), 2);
    assert_eq!(mock.writes(), vec![vec![0, 17, 255], vec![1, 2]]);

    assert_eq!(
        device.write(vec![1i32, 256, 3]),
        Err(HidError::Validation(ValidationError::OutOfRange {
            index: 1,
            value: 256
        }))
    );
    assert!(matches!(
        device.write(json!({"report": [1]})),
        Err(HidError::Validation(ValidationError::NotByteSequence(_)))
    ));
    assert!(matches!(
        device.send_feature_report(json!([1, -1])),
        Err(HidError::Validation(ValidationError::OutOfRange { .. }))
    ));
    // Rejected data never reached the transport
    assert_eq!(mock.writes().len(), 2);
    assert!(mock.sent_feature_reports().is_empty());

    assert_eq!(device.send_feature_report([5u8, 1]).unwrap(), 2);
    assert_eq!(mock.sent_feature_reports(), vec![vec![5, 1]]);
}

#[test]
fn transport_write_error_is_returned() {
    let (_backend, mock, device) = open_mock();
    mock.fail_writes(Some(TransportError::Disconnected));
    assert_eq!(
        device.write([1u8]),
        Err(HidError::Transport(TransportError::Disconnected))
    );
}

#[test]
fn feature_reports() {
    let (_backend, mock, device) = open_mock();
    mock.set_feature_report(3, vec![3, 10, 20, 30]);

    assert_eq!(device.get_feature_report(3, 4).unwrap(), vec![3, 10, 20, 30]);
    assert_eq!(
        device.get_feature_report(3, 0),
        Err(HidError::Validation(ValidationError::ZeroLength))
    );
}

#[test]
fn one_shot_reads() {
    let (_backend, mock, device) = open_mock();

    assert_eq!(device.read_timeout(0).unwrap(), None);
    assert_eq!(device.read_timeout(20).unwrap(), None);

    mock.feed(vec![9, 9]);
    assert_eq!(device.read().unwrap(), vec![9, 9]);
    mock.feed(vec![8]);
    assert_eq!(device.read_timeout(1000).unwrap(), Some(vec![8]));
}

#[test]
fn one_shot_read_refused_while_loop_active() {
    let (_backend, mock, device) = open_mock();
    let recorder = Recorder::new();
    device.add_listener(EventKind::Data, recorder.listener()).unwrap();
    wait_for("loop to start", || device.state() == AdapterState::Active);

    assert_eq!(device.read_timeout(10), Err(HidError::ReadInProgress));
    assert_eq!(device.read(), Err(HidError::ReadInProgress));

    device.pause();
    // Waits out the cancelled loop read
    assert_eq!(device.read_timeout(20).unwrap(), None);
    mock.feed(vec![7]);
    assert_eq!(device.read_timeout(1000).unwrap(), Some(vec![7]));
    assert_eq!(recorder.len(), 0);
    assert_eq!(mock.max_concurrent_reads(), 1);
}

#[test]
fn device_info_and_nonblocking() {
    let backend = MockBackend::new();
    let mock = backend.add_device("mock0");
    let cfg = AdapterConfig {
        nonblocking: true,
        ..config()
    };
    let device = HidDevice::open_with(&backend, &DeviceSelector::path("mock0"), cfg).unwrap();
    assert!(mock.is_nonblocking());

    device.set_nonblocking(false).unwrap();
    assert!(!mock.is_nonblocking());

    let info = device.device_info().unwrap();
    assert_eq!(info.path, "mock0");
    assert_eq!(info, *mock.descriptor());
}

// ── Open ──

#[test]
fn open_failures() {
    let backend = MockBackend::new();
    backend.add_device("mock0");

    assert!(matches!(
        HidDevice::open_with(&backend, &DeviceSelector::path("mock9"), config()),
        Err(HidError::Open(TransportError::DeviceNotFound(_)))
    ));
    assert!(matches!(
        HidDevice::open_with(&backend, &DeviceSelector::path(""), config()),
        Err(HidError::Construction(_))
    ));

    backend.fail_open(Some(TransportError::HidPermissionDenied("EACCES".into())));
    assert!(matches!(
        HidDevice::open_with(&backend, &DeviceSelector::path("mock0"), config()),
        Err(HidError::Open(TransportError::HidPermissionDenied(_)))
    ));
}

#[test]
fn open_by_vendor_and_product() {
    let backend = MockBackend::new();
    let mock = backend.add_device("mock0");
    let selector: DeviceSelector = "1209:0001".parse().unwrap();
    let device = HidDevice::open_with(&backend, &selector, config()).unwrap();
    assert_eq!(device.device_info().unwrap(), *mock.descriptor());
}

// ── Close ──

#[test]
fn close_while_active_is_quiet() {
    let (_backend, mock, device) = open_mock();
    let recorder = Recorder::new();
    device.add_listener(EventKind::Data, recorder.listener()).unwrap();
    device.add_listener(EventKind::Error, recorder.listener()).unwrap();
    wait_for("a read to be in flight", || mock.read_calls() > 0);

    device.close().unwrap();
    assert_eq!(device.state(), AdapterState::Closed);
    assert_eq!(device.listener_count(EventKind::Data), 0);

    mock.feed(vec![1]);
    std::thread::sleep(QUIET);
    assert!(recorder.events().is_empty());
    assert_eq!(mock.close_calls(), 1);
}

#[test]
fn close_from_inside_listener() {
    let backend = MockBackend::new();
    let mock = backend.add_device("mock0");
    let device = Arc::new(
        HidDevice::open_with(&backend, &DeviceSelector::path("mock0"), config()).unwrap(),
    );
    mock.feed(vec![1]);
    mock.feed(vec![2]);

    let errors = Recorder::new();
    device.add_listener(EventKind::Error, errors.listener()).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        let weak = Arc::downgrade(&device);
        device
            .on_data(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(device) = weak.upgrade() {
                    device.close().unwrap();
                }
            })
            .unwrap();
    }

    wait_for("close", || device.state() == AdapterState::Closed);
    std::thread::sleep(QUIET);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(errors.events().is_empty());
    assert_eq!(mock.close_calls(), 1);
}

#[test]
fn operations_after_close_fail() {
    let (_backend, mock, device) = open_mock();
    device.close().unwrap();

    assert_eq!(device.read(), Err(HidError::Closed));
    assert_eq!(device.read_timeout(10), Err(HidError::Closed));
    assert_eq!(device.write([1u8]), Err(HidError::Closed));
    assert_eq!(device.get_feature_report(1, 8), Err(HidError::Closed));
    assert_eq!(device.send_feature_report([1u8]), Err(HidError::Closed));
    assert_eq!(device.set_nonblocking(true), Err(HidError::Closed));
    assert_eq!(device.device_info(), Err(HidError::Closed));
    assert!(matches!(device.on_data(|_| {}), Err(HidError::Closed)));

    assert_eq!(device.close(), Err(HidError::Closed));
    assert_eq!(mock.close_calls(), 1);
    assert!(mock.writes().is_empty());
}

#[test]
fn drop_closes_the_handle() {
    let (_backend, mock, device) = open_mock();
    device.on_data(|_| {}).unwrap();
    drop(device);
    assert_eq!(mock.close_calls(), 1);
    assert!(mock.is_closed());
}
