//! State machine and bookkeeping shared by both connectors.
//!
//! One `RwLock` guards the state, the session, the registration table and
//! the subscription table. Broker round-trips during `start` and `stop`
//! happen outside the lock: `start` claims the transition by moving to
//! `Starting`, releases the lock while subscribing, then re-acquires it to
//! install the handles. `health` only ever waits on those short critical
//! sections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::dispatch::dispatcher;
use super::{ConnectorError, ConnectorState, Health, Host, Result};
use crate::transport::{self, MessageCallback, Session, Subscription};

/// What differs between connectors: how to connect, subscribe, publish.
#[async_trait]
pub(crate) trait Backend: Send + Sync {
    /// Connect and provision whatever must exist before `start`.
    async fn connect(&self) -> transport::Result<Arc<dyn Session>>;

    async fn subscribe(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> transport::Result<Box<dyn Subscription>>;

    async fn send(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
        payload: Bytes,
    ) -> transport::Result<()>;
}

struct Tables {
    state: ConnectorState,
    session: Option<Arc<dyn Session>>,
    registrations: HashMap<String, String>,
    subscriptions: HashMap<String, Box<dyn Subscription>>,
}

pub(crate) struct Lifecycle {
    tables: RwLock<Tables>,
    workload: Arc<AtomicI64>,
    host: Arc<dyn Host>,
}

impl Lifecycle {
    pub(crate) fn new(host: Arc<dyn Host>) -> Self {
        Self {
            tables: RwLock::new(Tables {
                state: ConnectorState::Created,
                session: None,
                registrations: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            workload: Arc::new(AtomicI64::new(0)),
            host,
        }
    }

    pub(crate) async fn open<B: Backend + ?Sized>(&self, backend: &B) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.state {
            ConnectorState::Created => {}
            ConnectorState::Closed => return Err(ConnectorError::Closed),
            _ => return Ok(()),
        }

        // State stays Created on failure.
        let session = backend.connect().await?;
        tables.session = Some(session);
        tables.state = ConnectorState::Opened;
        info!("Connector opened");
        Ok(())
    }

    pub(crate) async fn register(&self, name: &str, group: &str) {
        let mut tables = self.tables.write().await;
        if let Some(previous) = tables
            .registrations
            .insert(name.to_string(), group.to_string())
        {
            debug!(event = %name, previous = %previous, group = %group, "Registration replaced");
        } else {
            debug!(event = %name, group = %group, "Event registered");
        }
        if tables.state == ConnectorState::Running {
            debug!(event = %name, "Registration applies from the next start");
        }
    }

    pub(crate) async fn start<B: Backend + ?Sized>(&self, backend: &B) -> Result<()> {
        let (session, previous, registrations) = {
            let mut tables = self.tables.write().await;
            match tables.state {
                ConnectorState::Running | ConnectorState::Starting => {
                    return Err(ConnectorError::AlreadyRunning)
                }
                ConnectorState::Created => return Err(ConnectorError::InvalidConnection),
                ConnectorState::Closed => return Err(ConnectorError::Closed),
                ConnectorState::Opened | ConnectorState::Stopped => {}
            }
            let session = tables
                .session
                .clone()
                .ok_or(ConnectorError::InvalidConnection)?;
            let previous = tables.state;
            tables.state = ConnectorState::Starting;
            (session, previous, tables.registrations.clone())
        };

        let mut created = Vec::with_capacity(registrations.len());
        for (name, group) in &registrations {
            let on_message = dispatcher(
                Arc::clone(&self.host),
                name.clone(),
                Arc::clone(&self.workload),
            );
            match backend.subscribe(&session, name, group, on_message).await {
                Ok(subscription) => {
                    debug!(event = %name, group = %group, "Subscribed");
                    created.push((name.clone(), subscription));
                }
                Err(e) => {
                    warn!(
                        event = %name,
                        group = %group,
                        error = %e,
                        rolled_back = created.len(),
                        "Subscription failed, rolling back start"
                    );
                    unsubscribe_all(created).await;
                    let mut tables = self.tables.write().await;
                    if tables.state == ConnectorState::Starting {
                        tables.state = previous;
                    }
                    return Err(e.into());
                }
            }
        }

        let mut tables = self.tables.write().await;
        if tables.state != ConnectorState::Starting {
            // Closed while subscribing.
            drop(tables);
            unsubscribe_all(created).await;
            return Err(ConnectorError::Closed);
        }
        tables.subscriptions = created.into_iter().collect();
        tables.state = ConnectorState::Running;
        info!(subscriptions = tables.subscriptions.len(), "Connector started");
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        let subscriptions = {
            let mut tables = self.tables.write().await;
            if tables.state != ConnectorState::Running {
                return Err(ConnectorError::NotRunning);
            }
            tables.state = ConnectorState::Stopped;
            std::mem::take(&mut tables.subscriptions)
        };

        let count = subscriptions.len();
        let first_error = unsubscribe_all(subscriptions).await;
        info!(subscriptions = count, "Connector stopped");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub(crate) async fn publish<B: Backend + ?Sized>(
        &self,
        backend: &B,
        name: &str,
        payload: Bytes,
    ) -> Result<()> {
        let session = {
            let tables = self.tables.read().await;
            match tables.state {
                ConnectorState::Created | ConnectorState::Closed => {
                    return Err(ConnectorError::InvalidConnection)
                }
                _ => tables
                    .session
                    .clone()
                    .ok_or(ConnectorError::InvalidConnection)?,
            }
        };

        backend.send(&session, name, payload).await?;
        debug!(event = %name, "Published");
        Ok(())
    }

    pub(crate) async fn health(&self) -> Health {
        let tables = self.tables.read().await;
        Health {
            workload: self.workload.load(Ordering::SeqCst),
            state: tables.state,
        }
    }

    pub(crate) async fn state(&self) -> ConnectorState {
        self.tables.read().await.state
    }

    pub(crate) async fn close(&self) {
        let (session, subscriptions) = {
            let mut tables = self.tables.write().await;
            if tables.state == ConnectorState::Closed {
                return;
            }
            tables.state = ConnectorState::Closed;
            (
                tables.session.take(),
                std::mem::take(&mut tables.subscriptions),
            )
        };

        unsubscribe_all(subscriptions).await;
        if let Some(session) = session {
            session.close().await;
        }
        info!("Connector closed");
    }

    #[cfg(test)]
    pub(crate) async fn registrations(&self) -> HashMap<String, String> {
        self.tables.read().await.registrations.clone()
    }

    #[cfg(test)]
    pub(crate) async fn subscribed_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .await
            .subscriptions
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Unsubscribe everything, logging failures. Returns the first failure.
async fn unsubscribe_all<I>(subscriptions: I) -> Option<transport::TransportError>
where
    I: IntoIterator<Item = (String, Box<dyn Subscription>)>,
{
    let mut first_error = None;
    for (name, subscription) in subscriptions {
        if let Err(e) = subscription.unsubscribe().await {
            error!(event = %name, error = %e, "Failed to unsubscribe");
            first_error.get_or_insert(e);
        }
    }
    first_error
}
