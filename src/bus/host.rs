//! Application side of a connector.
//!
//! The connector never runs business logic itself. For every delivered
//! message it hands a [`Task`] to [`Host::submit`], and that task calls
//! [`Host::serve`] later, on whatever worker the host picked.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{error, warn};

/// Unit of work handed to the host's worker pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Error returned by an event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business handler for one event name.
pub type EventHandler = Arc<dyn Fn(Bytes) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Task submission and event serving, provided by the application.
pub trait Host: Send + Sync {
    /// Queue `task` for asynchronous execution and return immediately.
    /// No ordering is guaranteed between submitted tasks.
    fn submit(&self, task: Task);

    /// Invoke the business handler(s) registered for `name`.
    /// Handler failures are the host's to deal with.
    fn serve(&self, name: &str, payload: Bytes);
}

/// Host that runs tasks on a tokio runtime's blocking pool.
pub struct TokioHost {
    runtime: Handle,
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl TokioHost {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            handlers: HashMap::new(),
        }
    }

    /// Add a handler for `name`. Several handlers may share a name.
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Event names with at least one handler.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Host for TokioHost {
    fn submit(&self, task: Task) {
        // Detached; the task owns everything it needs.
        drop(self.runtime.spawn_blocking(task));
    }

    fn serve(&self, name: &str, payload: Bytes) {
        let Some(handlers) = self.handlers.get(name) else {
            warn!(event = %name, "No handler registered for event");
            return;
        };

        for handler in handlers {
            if let Err(e) = handler(payload.clone()) {
                error!(event = %name, error = %e, "Event handler failed");
            }
        }
    }
}
