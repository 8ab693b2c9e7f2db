//! NATS transport using the `async-nats` client.
//!
//! Subscriptions are drained by one tokio task each; that task is the
//! "broker delivery thread" the connectors must never block. Unsubscribing
//! signals the task through a oneshot channel and waits for it to finish.
//!
//! JetStream durable queue consumers are push consumers with
//! `DeliverPolicy::New` and explicit acks. A message is acked once its
//! callback has returned, i.e. once the work was handed off.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{push, AckPolicy, DeliverPolicy},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Broker, ConnectOptions, DurableSubscription, MessageCallback, Result, Session, Subscription,
    TransportError,
};

/// Upper bound on the final flush when a session closes. A client stuck
/// reconnecting would otherwise hold `close` forever.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a durable consumer identifier onto a name the server accepts.
///
/// JetStream consumer names may not contain `.`, `*`, `>` or whitespace.
pub fn consumer_name(durable: &str) -> String {
    durable
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Broker backed by a NATS server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsBroker;

impl NatsBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>> {
        let mut connect = async_nats::ConnectOptions::new();
        if let Some(token) = &options.token {
            connect = connect.token(token.clone());
        }
        if let Some((user, password)) = &options.user_password {
            connect = connect.user_and_password(user.clone(), password.clone());
        }

        let client = connect
            .connect(options.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        info!(url = %options.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        Ok(Arc::new(NatsSession {
            connection: RwLock::new(Some(Connection { client, jetstream })),
        }))
    }
}

#[derive(Clone)]
struct Connection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

/// Session on a NATS server.
pub struct NatsSession {
    connection: RwLock<Option<Connection>>,
}

impl NatsSession {
    async fn connection(&self) -> Result<Connection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl Session for NatsSession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let conn = self.connection().await?;
        conn.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn flush(&self) -> Result<()> {
        let conn = self.connection().await?;
        conn.client
            .flush()
            .await
            .map_err(|e| TransportError::Flush(e.to_string()))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>> {
        let conn = self.connection().await?;
        let mut subscriber = conn
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        // Interest must be known to the server before start returns.
        conn.client
            .flush()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        return subscriber
                            .unsubscribe()
                            .await
                            .map_err(|e| TransportError::Unsubscribe(e.to_string()));
                    }
                    message = subscriber.next() => match message {
                        Some(message) => on_message(message.payload),
                        None => return Ok(()),
                    },
                }
            }
        });

        Ok(Box::new(NatsSubscription {
            stop: stop_tx,
            task,
        }))
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        let conn = self.connection().await?;
        match conn.jetstream.get_stream(stream).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(stream = %stream, error = %e, "Stream lookup failed");
                Ok(false)
            }
        }
    }

    async fn create_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()> {
        let conn = self.connection().await?;
        conn.jetstream
            .create_stream(StreamConfig {
                name: stream.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok(())
    }

    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let conn = self.connection().await?;
        conn.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn durable_queue_subscribe(
        &self,
        consumer: DurableSubscription<'_>,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>> {
        let conn = self.connection().await?;
        let name = consumer_name(consumer.durable);

        let stream = conn
            .jetstream
            .get_stream(consumer.stream)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let durable: jetstream::consumer::Consumer<push::Config> = stream
            .get_or_create_consumer(
                &name,
                push::Config {
                    durable_name: Some(name.clone()),
                    deliver_subject: conn.client.new_inbox(),
                    deliver_group: Some(name.clone()),
                    filter_subject: consumer.subject.to_string(),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let mut messages = durable
            .messages()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return Ok(()),
                    message = messages.next() => match message {
                        Some(Ok(message)) => {
                            on_message(message.message.payload.clone());
                            if let Err(e) = message.ack().await {
                                warn!(consumer = %name, error = %e, "Failed to ack message");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(consumer = %name, error = %e, "JetStream delivery error");
                        }
                        None => return Ok(()),
                    },
                }
            }
        });

        Ok(Box::new(NatsSubscription {
            stop: stop_tx,
            task,
        }))
    }

    async fn close(&self) {
        let connection = self.connection.write().await.take();
        if let Some(conn) = connection {
            flush_within(conn.client.flush(), CLOSE_FLUSH_TIMEOUT).await;
            // Dropping the last client handle shuts the connection down.
            drop(conn);
            info!("NATS connection closed");
        }
    }
}

/// Wait for `flush` at most `limit`. Returns whether it completed cleanly.
async fn flush_within<F, E>(flush: F, limit: Duration) -> bool
where
    F: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(limit, flush).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Final flush failed, pending messages may be lost");
            false
        }
        Err(_) => {
            warn!(timeout = ?limit, "Final flush timed out, pending messages may be lost");
            false
        }
    }
}

/// Handle for a subscription drained by a tokio task.
pub struct NatsSubscription {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        // The task may already have ended because the connection closed.
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name_replaces_separators() {
        assert_eq!(
            consumer_name("APPE.order_created_billing"),
            "APPE_order_created_billing"
        );
    }

    #[test]
    fn test_consumer_name_replaces_wildcards_and_whitespace() {
        assert_eq!(consumer_name("A.*.> b"), "A_____b");
    }

    #[tokio::test]
    async fn test_flush_within_gives_up_on_stuck_flush() {
        let stuck = std::future::pending::<std::result::Result<(), String>>();
        let started = std::time::Instant::now();

        assert!(!flush_within(stuck, Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_flush_within_reports_outcome() {
        assert!(flush_within(async { Ok::<(), String>(()) }, CLOSE_FLUSH_TIMEOUT).await);
        let failed = async { Err::<(), _>("connection closed".to_string()) };
        assert!(!flush_within(failed, CLOSE_FLUSH_TIMEOUT).await);
    }

    #[test]
    fn test_consumer_name_keeps_legal_names() {
        assert_eq!(consumer_name("APPE_x_g1"), "APPE_x_g1");
    }
}
