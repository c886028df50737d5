//! Shared helpers for the adapter integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use hidstream::{AdapterConfig, HidEvent, Listener};
use parking_lot::Mutex;

/// Poll interval of the read loop under test
pub const POLL_MS: i32 = 5;

/// How long to wait for something that should not happen
pub const QUIET: Duration = Duration::from_millis(60);

pub fn config() -> AdapterConfig {
    AdapterConfig {
        read_timeout_ms: POLL_MS,
        ..AdapterConfig::default()
    }
}

/// Block until `cond` holds, failing the test after a few seconds
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Async variant of [`wait_for`] that yields to the runtime while waiting
pub async fn wait_for_async(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Collects every event delivered to its listeners, across kinds, in order
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<HidEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> Listener {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &HidEvent| events.lock().push(event.clone()))
    }

    pub fn events(&self) -> Vec<HidEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

/// A report of `len` zero bytes
pub fn zeros(len: usize) -> Vec<u8> {
    vec![0; len]
}
