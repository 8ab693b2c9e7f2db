//! Eventwire - event distribution connectors
//!
//! Lets an application publish named events and have them delivered,
//! asynchronously and once per consumer group, to every process that
//! registered interest. Two connectors share one lifecycle contract:
//!
//! - [`bus::nats::NatsConnector`]: plain NATS subjects with queue groups
//! - [`bus::jetstream::JetStreamConnector`]: durable queue consumers on an
//!   auto-provisioned JetStream stream
//!
//! The broker client sits behind [`transport::Broker`], and business logic
//! behind [`bus::Host`].

pub mod bus;
pub mod config;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
