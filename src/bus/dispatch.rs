//! Broker callback to host task hand-off.
//!
//! Broker callbacks run on the broker client's delivery task, shared by
//! every subscription of the session. The callback built here only counts
//! the message into the workload and submits a task; serving happens on the
//! host's pool.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::Host;
use crate::transport::MessageCallback;

/// Counts one in-flight event; released when the task finishes or is dropped.
struct WorkloadGuard {
    workload: Arc<AtomicI64>,
}

impl WorkloadGuard {
    fn acquire(workload: &Arc<AtomicI64>) -> Self {
        workload.fetch_add(1, Ordering::SeqCst);
        Self {
            workload: Arc::clone(workload),
        }
    }
}

impl Drop for WorkloadGuard {
    fn drop(&mut self) {
        self.workload.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the delivery callback for event `name`.
pub fn dispatcher(host: Arc<dyn Host>, name: String, workload: Arc<AtomicI64>) -> MessageCallback {
    Arc::new(move |payload: Bytes| {
        let guard = WorkloadGuard::acquire(&workload);
        let serving = Arc::clone(&host);
        let name = name.clone();
        trace!(event = %name, bytes = payload.len(), "Dispatching event");

        host.submit(Box::new(move || {
            let _guard = guard;
            serving.serve(&name, payload);
        }));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ParkingHost;

    #[test]
    fn test_callback_submits_without_serving() {
        let host = Arc::new(ParkingHost::new());
        let workload = Arc::new(AtomicI64::new(0));
        let callback = dispatcher(host.clone(), "x".to_string(), Arc::clone(&workload));

        callback(Bytes::from_static(b"a"));
        callback(Bytes::from_static(b"b"));

        assert!(host.served().is_empty());
        assert_eq!(host.parked(), 2);
        assert_eq!(workload.load(Ordering::SeqCst), 2);

        host.run_parked();

        let served = host.served();
        assert_eq!(served.len(), 2);
        assert_eq!(served[0], ("x".to_string(), Bytes::from_static(b"a")));
        assert_eq!(workload.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_task_releases_workload() {
        let host = Arc::new(ParkingHost::new());
        let workload = Arc::new(AtomicI64::new(0));
        let callback = dispatcher(host.clone(), "x".to_string(), Arc::clone(&workload));

        callback(Bytes::new());
        host.discard_parked();

        assert_eq!(workload.load(Ordering::SeqCst), 0);
    }
}
