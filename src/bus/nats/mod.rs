//! Plain NATS connector.
//!
//! Events travel on subjects named exactly like the event. Each registered
//! event becomes a queue subscription with the registered group, so a
//! message reaches one live subscriber per group. Publishing flushes right
//! away to bound what an abrupt disconnect can lose.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::lifecycle::{Backend, Lifecycle};
use super::{Connector, ConnectorState, Health, Host, Result};
use crate::config::{InstanceConfig, NatsSettings};
use crate::transport::{self, Broker, MessageCallback, Session, Subscription};

/// Connector for plain NATS publish/subscribe.
pub struct NatsConnector {
    settings: NatsSettings,
    broker: Arc<dyn Broker>,
    lifecycle: Lifecycle,
}

impl NatsConnector {
    pub fn new(settings: NatsSettings, broker: Arc<dyn Broker>, host: Arc<dyn Host>) -> Self {
        Self {
            settings,
            broker,
            lifecycle: Lifecycle::new(host),
        }
    }

    /// Build from an event-bus instance config.
    pub fn from_instance(
        instance: &InstanceConfig,
        broker: Arc<dyn Broker>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        let settings = NatsSettings::from_instance(instance)?;
        Ok(Self::new(settings, broker, host))
    }

    pub fn settings(&self) -> &NatsSettings {
        &self.settings
    }
}

#[async_trait]
impl Backend for NatsConnector {
    async fn connect(&self) -> transport::Result<Arc<dyn Session>> {
        self.broker.connect(&self.settings.connect_options()).await
    }

    async fn subscribe(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> transport::Result<Box<dyn Subscription>> {
        session.queue_subscribe(name, group, on_message).await
    }

    async fn send(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        payload: Bytes,
    ) -> transport::Result<()> {
        session.publish(name, payload).await?;
        session.flush().await
    }
}

#[async_trait]
impl Connector for NatsConnector {
    #[tracing::instrument(name = "nats.open", skip_all, fields(url = %self.settings.url))]
    async fn open(&self) -> Result<()> {
        self.lifecycle.open(self).await
    }

    async fn register(&self, name: &str, group: &str) {
        self.lifecycle.register(name, group).await
    }

    #[tracing::instrument(name = "nats.start", skip_all)]
    async fn start(&self) -> Result<()> {
        self.lifecycle.start(self).await
    }

    #[tracing::instrument(name = "nats.stop", skip_all)]
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

#[cfg(test)]
mod tests;
