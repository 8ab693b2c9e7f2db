//! Connector construction by driver name.
//!
//! Each event-bus connection in the configuration names a driver. A
//! [`DriverRegistry`] maps those names to [`Driver`]s, which build an
//! unopened connector from the connection's settings. Registries are plain
//! values built at startup; nothing registers itself globally.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Connector, ConnectorError, Host, JetStreamConnector, NatsConnector, Result};
use crate::config::{Config, InstanceConfig};
use crate::transport::Broker;

/// Driver name of the plain NATS connector.
pub const NATS_DRIVER: &str = "nats";
/// Driver names of the JetStream connector.
pub const JETSTREAM_DRIVERS: [&str; 2] = ["natsjs", "nats-js"];

/// Builds connectors for one driver name.
pub trait Driver: Send + Sync {
    /// `app_name` is the application name from the loaded configuration,
    /// if any. It takes precedence over anything the driver was built with.
    fn connect(
        &self,
        instance: &InstanceConfig,
        app_name: Option<&str>,
        host: Arc<dyn Host>,
    ) -> Result<Box<dyn Connector>>;
}

/// Driver for [`NatsConnector`].
pub struct NatsDriver {
    broker: Arc<dyn Broker>,
}

impl NatsDriver {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

impl Driver for NatsDriver {
    fn connect(
        &self,
        instance: &InstanceConfig,
        _app_name: Option<&str>,
        host: Arc<dyn Host>,
    ) -> Result<Box<dyn Connector>> {
        let connector = NatsConnector::from_instance(instance, Arc::clone(&self.broker), host)?;
        Ok(Box::new(connector))
    }
}

/// Driver for [`JetStreamConnector`].
pub struct JetStreamDriver {
    broker: Arc<dyn Broker>,
    app_name: Option<String>,
}

impl JetStreamDriver {
    pub fn new(broker: Arc<dyn Broker>, app_name: Option<String>) -> Self {
        Self { broker, app_name }
    }
}

impl Driver for JetStreamDriver {
    fn connect(
        &self,
        instance: &InstanceConfig,
        app_name: Option<&str>,
        host: Arc<dyn Host>,
    ) -> Result<Box<dyn Connector>> {
        let app_name = app_name
            .filter(|name| !name.is_empty())
            .or(self.app_name.as_deref());
        let connector = JetStreamConnector::from_instance(
            instance,
            app_name,
            Arc::clone(&self.broker),
            host,
        )?;
        Ok(Box::new(connector))
    }
}

/// Driver name to driver table.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the NATS and JetStream drivers over `broker`.
    pub fn with_defaults(broker: Arc<dyn Broker>, app_name: Option<String>) -> Self {
        let mut registry = Self::new();
        registry.register(NATS_DRIVER, NatsDriver::new(Arc::clone(&broker)));
        let jetstream: Arc<dyn Driver> = Arc::new(JetStreamDriver::new(broker, app_name));
        for name in JETSTREAM_DRIVERS {
            registry.register_shared(name, Arc::clone(&jetstream));
        }
        registry
    }

    /// Default drivers over a real NATS client.
    #[cfg(feature = "nats")]
    pub fn nats(app_name: Option<String>) -> Self {
        Self::with_defaults(Arc::new(crate::transport::NatsBroker::new()), app_name)
    }

    /// Register `driver` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, driver: impl Driver + 'static) {
        self.register_shared(name, Arc::new(driver));
    }

    pub fn register_shared(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        let name = name.into();
        debug!(driver = %name, "Driver registered");
        self.drivers.insert(name, driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build an unopened connector for `instance` using its driver.
    pub fn connect(
        &self,
        instance: &InstanceConfig,
        host: Arc<dyn Host>,
    ) -> Result<Box<dyn Connector>> {
        self.build(instance, None, host)
    }

    fn build(
        &self,
        instance: &InstanceConfig,
        app_name: Option<&str>,
        host: Arc<dyn Host>,
    ) -> Result<Box<dyn Connector>> {
        let driver = self
            .drivers
            .get(&instance.driver)
            .ok_or_else(|| ConnectorError::UnknownDriver(instance.driver.clone()))?;
        driver.connect(instance, app_name, host)
    }

    /// Build an unopened connector for every configured connection.
    ///
    /// The configuration's `app_name` overrides the one the registry was
    /// built with, so every instance of the application agrees on the
    /// JetStream stream.
    pub fn connect_all(
        &self,
        config: &Config,
        host: Arc<dyn Host>,
    ) -> Result<HashMap<String, Box<dyn Connector>>> {
        let mut connectors = HashMap::with_capacity(config.connections.len());
        for (name, instance) in &config.connections {
            let connector =
                self.build(instance, config.app_name.as_deref(), Arc::clone(&host))?;
            info!(connection = %name, driver = %instance.driver, "Connector created");
            connectors.insert(name.clone(), connector);
        }
        Ok(connectors)
    }
}
