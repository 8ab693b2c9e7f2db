//! JetStream connector.
//!
//! All events of an application share one stream named after the stream
//! prefix (see [`JetStreamSettings`]), capturing `<STREAM>.*`. Each
//! registered `(event, group)` pair becomes a durable queue consumer, so a
//! group keeps its position across restarts and a message reaches one live
//! instance per group. Consumers only see messages published after they
//! were first created.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::lifecycle::{Backend, Lifecycle};
use super::naming::{durable_consumer_id, wire_subject};
use super::{Connector, ConnectorState, Health, Host, Result};
use crate::config::{InstanceConfig, JetStreamSettings};
use crate::transport::{
    self, Broker, DurableSubscription, MessageCallback, Session, Subscription,
};

/// Connector for durable delivery through a JetStream stream.
pub struct JetStreamConnector {
    settings: JetStreamSettings,
    broker: Arc<dyn Broker>,
    lifecycle: Lifecycle,
}

impl JetStreamConnector {
    pub fn new(
        settings: JetStreamSettings,
        broker: Arc<dyn Broker>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            settings,
            broker,
            lifecycle: Lifecycle::new(host),
        }
    }

    /// Build from an event-bus instance config. `app_name` seeds the stream
    /// prefix when the instance does not name one.
    pub fn from_instance(
        instance: &InstanceConfig,
        app_name: Option<&str>,
        broker: Arc<dyn Broker>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        let settings = JetStreamSettings::from_instance(instance, app_name)?;
        Ok(Self::new(settings, broker, host))
    }

    pub fn settings(&self) -> &JetStreamSettings {
        &self.settings
    }

    /// Stream this connector publishes to and consumes from.
    pub fn stream(&self) -> &str {
        &self.settings.stream
    }

    /// Create the stream unless it exists. Losing a creation race to another
    /// instance counts as success.
    async fn ensure_stream(&self, session: &Arc<dyn Session>) -> transport::Result<()> {
        let stream = self.stream();
        if session.stream_exists(stream).await? {
            debug!(stream = %stream, "Stream already exists");
            return Ok(());
        }

        let subjects = vec![self.settings.subject_pattern()];
        match session.create_stream(stream, subjects).await {
            Ok(()) => {
                info!(
                    stream = %stream,
                    subjects = %self.settings.subject_pattern(),
                    "Created stream"
                );
                Ok(())
            }
            Err(e) => {
                if session.stream_exists(stream).await.unwrap_or(false) {
                    debug!(stream = %stream, "Stream created concurrently");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[async_trait]
impl Backend for JetStreamConnector {
    async fn connect(&self) -> transport::Result<Arc<dyn Session>> {
        let session = self
            .broker
            .connect(&self.settings.connection.connect_options())
            .await?;

        if let Err(e) = self.ensure_stream(&session).await {
            warn!(stream = %self.stream(), error = %e, "Stream provisioning failed");
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn subscribe(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> transport::Result<Box<dyn Subscription>> {
        let subject = wire_subject(name, self.stream());
        let durable = durable_consumer_id(name, self.stream(), group);
        session
            .durable_queue_subscribe(
                DurableSubscription {
                    stream: self.stream(),
                    subject: &subject,
                    durable: &durable,
                },
                on_message,
            )
            .await
    }

    async fn send(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        payload: Bytes,
    ) -> transport::Result<()> {
        session
            .stream_publish(&wire_subject(name, self.stream()), payload)
            .await
    }
}

#[async_trait]
impl Connector for JetStreamConnector {
    #[tracing::instrument(
        name = "jetstream.open",
        skip_all,
        fields(url = %self.settings.connection.url, stream = %self.settings.stream)
    )]
    async fn open(&self) -> Result<()> {
        self.lifecycle.open(self).await
    }

    async fn register(&self, name: &str, group: &str) {
        self.lifecycle.register(name, group).await
    }

    #[tracing::instrument(
        name = "jetstream.start",
        skip_all,
        fields(stream = %self.settings.stream)
    )]
    async fn start(&self) -> Result<()> {
        self.lifecycle.start(self).await
    }

    #[tracing::instrument(
        name = "jetstream.stop",
        skip_all,
        fields(stream = %self.settings.stream)
    )]
    async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await
    }

    async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        self.lifecycle.publish(self, name, payload).await
    }

    async fn health(&self) -> Health {
        self.lifecycle.health().await
    }

    async fn state(&self) -> ConnectorState {
        self.lifecycle.state().await
    }

    async fn close(&self) {
        self.lifecycle.close().await
    }
}
