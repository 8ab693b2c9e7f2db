//! Test hosts.
//!
//! Hosts standing in for an application's event bus so connector tests can
//! observe what was dispatched and when.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::bus::{Host, Task};

/// Host that runs every task on a fresh thread and records served events.
#[derive(Default)]
pub struct RecordingHost {
    served: Mutex<Vec<(String, Bytes)>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn served(&self) -> Vec<(String, Bytes)> {
        self.served.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.served.lock().unwrap().len()
    }

    /// Wait until at least `count` events were served, or five seconds pass.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, Bytes)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.count() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.served()
    }
}

impl Host for RecordingHost {
    fn submit(&self, task: Task) {
        std::thread::spawn(task);
    }

    fn serve(&self, name: &str, payload: Bytes) {
        self.served
            .lock()
            .unwrap()
            .push((name.to_string(), payload));
    }
}

/// Host that parks submitted tasks until the test runs them.
#[derive(Default)]
pub struct ParkingHost {
    parked: Mutex<Vec<Task>>,
    served: Mutex<Vec<(String, Bytes)>>,
}

impl ParkingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    pub fn run_parked(&self) {
        let tasks: Vec<Task> = std::mem::take(&mut *self.parked.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    pub fn discard_parked(&self) {
        self.parked.lock().unwrap().clear();
    }

    pub fn served(&self) -> Vec<(String, Bytes)> {
        self.served.lock().unwrap().clone()
    }
}

impl Host for ParkingHost {
    fn submit(&self, task: Task) {
        self.parked.lock().unwrap().push(task);
    }

    fn serve(&self, name: &str, payload: Bytes) {
        self.served
            .lock()
            .unwrap()
            .push((name.to_string(), payload));
    }
}
