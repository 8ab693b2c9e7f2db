//! Broker transport seam.
//!
//! The connectors never talk to a broker client directly. They go through
//! [`Broker`] (connection establishment) and [`Session`] (everything done on
//! an established connection), so the same lifecycle code drives a real NATS
//! server or the in-process [`memory::MemoryBroker`].
//!
//! Implementations:
//! - `NatsBroker`: async-nats client with JetStream (feature `nats`)
//! - `MemoryBroker`: in-process broker with queue groups and durable consumers

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker client.
///
/// Messages are carried verbatim from the underlying client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Flush failed: {0}")]
    Flush(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("Stream provisioning failed: {0}")]
    Stream(String),
}

/// Callback invoked by the broker client for every delivered message.
///
/// Runs on a task owned by the broker client and must return immediately.
pub type MessageCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Connection parameters handed to [`Broker::connect`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker address, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Token authentication.
    pub token: Option<String>,
    /// Username/password authentication.
    pub user_password: Option<(String, String)>,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user_password(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user_password = Some((user.into(), password.into()));
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field(
                "user",
                &self.user_password.as_ref().map(|(user, _)| user.as_str()),
            )
            .finish()
    }
}

/// Durable queue consumer on a stream.
///
/// The consumer only receives messages published after it was first
/// created. Instances subscribing with the same `durable` share it, and each
/// message goes to exactly one of them.
#[derive(Debug, Clone, Copy)]
pub struct DurableSubscription<'a> {
    pub stream: &'a str,
    pub subject: &'a str,
    pub durable: &'a str,
}

/// Establishes broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>>;
}

/// An established broker connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Fire-and-forget publish on a plain subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Wait until everything buffered has reached the server.
    async fn flush(&self) -> Result<()>;

    /// Join `group` on `subject`. Each message goes to one member per group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>>;

    async fn stream_exists(&self, stream: &str) -> Result<bool>;

    async fn create_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()>;

    /// Publish into a stream and wait for the server's acknowledgement.
    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn durable_queue_subscribe(
        &self,
        consumer: DurableSubscription<'_>,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>>;

    /// Tear down the connection. Live subscriptions stop receiving.
    ///
    /// Never fails and never waits on an unreachable server for long.
    async fn close(&self);
}

/// A live subscription handle.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_debug_redacts_secrets() {
        let options = ConnectOptions::new("nats://localhost:4222")
            .with_token("s3cret")
            .with_user_password("alice", "hunter2");

        let printed = format!("{:?}", options);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("s3cret"));
        assert!(!printed.contains("hunter2"));
    }
}
