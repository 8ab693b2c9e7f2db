//! Event connectors.
//!
//! This module contains:
//! - `Connector` trait: the lifecycle contract every backend implements
//! - `Host` trait: the application side (task submission, event serving)
//! - Connector errors, state and health types
//! - Implementations: plain NATS, JetStream
//!
//! Lifecycle:
//!
//! ```text
//! Created --open--> Opened --start--> Running --stop--> Stopped --start--> Running ...
//!    \                 \                  \                 \
//!     +-----------------+------------------+-----------------+--close--> Closed
//! ```

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ConfigError;
use crate::transport::TransportError;

pub mod dispatch;
pub mod driver;
pub mod host;
pub mod jetstream;
mod lifecycle;
pub mod naming;
pub mod nats;

pub use driver::{Driver, DriverRegistry, JetStreamDriver, NatsDriver};
pub use host::{Host, Task, TokioHost};
pub use jetstream::JetStreamConnector;
pub use nats::NatsConnector;

/// Result type for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors that can occur during connector operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connector is already running")]
    AlreadyRunning,

    #[error("Connector is not running")]
    NotRunning,

    #[error("Invalid event connection")]
    InvalidConnection,

    #[error("Connector is closed")]
    Closed,

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Constructed, no broker session.
    Created,
    /// Session established, not consuming.
    Opened,
    /// `start` is creating subscriptions.
    Starting,
    /// Consuming registered events.
    Running,
    /// Subscriptions removed; session still open.
    Stopped,
    /// Session torn down. Terminal.
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorState::Created => "created",
            ConnectorState::Opened => "opened",
            ConnectorState::Starting => "starting",
            ConnectorState::Running => "running",
            ConnectorState::Stopped => "stopped",
            ConnectorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connector health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    /// Dispatched events whose handler has not finished yet.
    pub workload: i64,
    pub state: ConnectorState,
}

/// Lifecycle contract shared by the NATS and JetStream connectors.
///
/// Call order: `open`, any number of `register`, `start`, then `publish`
/// freely; `stop`/`start` may alternate; `close` at any point ends it.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the broker session (and provision what the backend needs).
    ///
    /// Opening an already opened connector is a no-op.
    async fn open(&self) -> Result<()>;

    /// Map `name` to consumer group `group`. The last registration for a
    /// name wins. Takes effect on the next `start`.
    async fn register(&self, name: &str, group: &str);

    /// Subscribe every registered event.
    ///
    /// On failure, subscriptions made by this call are removed again and
    /// the connector stays open, so `start` can be retried.
    async fn start(&self) -> Result<()>;

    /// Remove every subscription made by `start`.
    async fn stop(&self) -> Result<()>;

    /// Send `payload` to the subscribers of `name`.
    async fn publish(&self, name: &str, payload: Bytes) -> Result<()>;

    async fn health(&self) -> Health;

    async fn state(&self) -> ConnectorState;

    /// Tear down the session. Idempotent; never fails.
    async fn close(&self);
}
