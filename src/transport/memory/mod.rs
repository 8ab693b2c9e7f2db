//! In-process broker.
//!
//! Behaves like a single NATS server with JetStream enabled, without the
//! network: queue groups deliver each message to one member per group,
//! streams capture subjects by pattern, and durable consumers are shared by
//! name and hold messages while they have no members.
//!
//! Callbacks run on the publishing task, after the broker lock is released.
//! Fault injection hooks exist so connector failure paths can be exercised.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use super::{
    Broker, ConnectOptions, DurableSubscription, MessageCallback, Result, Session, Subscription,
    TransportError,
};

/// In-process broker shared by every session it hands out.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    refuse_connections: AtomicBool,
    refuse_publish: AtomicBool,
    refuse_streams: AtomicBool,
    subscribe_gate: Mutex<Option<Arc<Semaphore>>>,
    waiting_subscribes: AtomicUsize,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<ConnectOptions>,
    subscribers: Vec<Subscriber>,
    /// Round-robin position per (published subject, queue group).
    cursors: HashMap<(String, String), usize>,
    streams: HashMap<String, StreamState>,
    /// Remaining successful subscribes before every further one fails.
    subscribe_budget: Option<usize>,
}

struct Subscriber {
    id: u64,
    session: u64,
    subject: String,
    group: String,
    callback: MessageCallback,
}

struct StreamState {
    subjects: Vec<String>,
    consumers: BTreeMap<String, DurableConsumer>,
}

struct DurableConsumer {
    filter: String,
    members: Vec<Member>,
    next: usize,
    pending: VecDeque<Bytes>,
}

struct Member {
    id: u64,
    session: u64,
    callback: MessageCallback,
}

/// NATS subject matching: `*` matches one token, `>` the remaining tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn deliver(deliveries: Vec<(MessageCallback, Bytes)>) {
    for (callback, payload) in deliveries {
        callback(payload);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Make every subsequent connect fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make every subsequent publish fail.
    pub fn refuse_publish(&self, refuse: bool) {
        self.shared.refuse_publish.store(refuse, Ordering::SeqCst);
    }

    /// Make stream creation fail.
    pub fn refuse_streams(&self, refuse: bool) {
        self.shared.refuse_streams.store(refuse, Ordering::SeqCst);
    }

    /// Allow `successes` more subscribes, then fail the rest.
    pub async fn fail_subscribes_after(&self, successes: usize) {
        self.shared.state.lock().await.subscribe_budget = Some(successes);
    }

    /// Park every subscribe until permits are added to the returned gate.
    pub async fn hold_subscribes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.shared.subscribe_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }

    /// Number of subscribes currently parked on the gate.
    pub fn waiting_subscribes(&self) -> usize {
        self.shared.waiting_subscribes.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Options of every connection attempt that succeeded, oldest first.
    pub async fn connections(&self) -> Vec<ConnectOptions> {
        self.shared.state.lock().await.connections.clone()
    }

    /// Number of plain subscriptions on exactly `subject`.
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .subscribers
            .iter()
            .filter(|s| s.subject == subject)
            .count()
    }

    /// Queue groups of the plain subscriptions on exactly `subject`.
    pub async fn queue_groups(&self, subject: &str) -> Vec<String> {
        let state = self.shared.state.lock().await;
        let mut groups: Vec<String> = state
            .subscribers
            .iter()
            .filter(|s| s.subject == subject)
            .map(|s| s.group.clone())
            .collect();
        groups.sort();
        groups
    }

    /// Queue-group round-robin positions currently tracked.
    pub async fn queue_cursors(&self) -> usize {
        self.shared.state.lock().await.cursors.len()
    }

    pub async fn stream_subjects(&self, stream: &str) -> Option<Vec<String>> {
        let state = self.shared.state.lock().await;
        state.streams.get(stream).map(|s| s.subjects.clone())
    }

    /// Durable consumer names on a stream, sorted.
    pub async fn consumer_names(&self, stream: &str) -> Vec<String> {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.consumers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Filter subject of a durable consumer.
    pub async fn consumer_filter(&self, stream: &str, durable: &str) -> Option<String> {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.filter.clone())
    }

    /// Live members of a durable consumer.
    pub async fn consumer_members(&self, stream: &str, durable: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.members.len())
            .unwrap_or(0)
    }

    async fn pass_gate(&self) -> Result<()> {
        let gate = self.shared.subscribe_gate.lock().await.clone();
        if let Some(gate) = gate {
            self.shared.waiting_subscribes.fetch_add(1, Ordering::SeqCst);
            let permit = gate.acquire().await;
            self.shared.waiting_subscribes.fetch_sub(1, Ordering::SeqCst);
            // One permit admits one subscribe.
            permit
                .map_err(|e| TransportError::Subscribe(e.to_string()))?
                .forget();
        }
        Ok(())
    }
}

impl BrokerState {
    /// Forget round-robin positions of groups with no matching member left.
    fn prune_cursors(&mut self) {
        let subscribers = &self.subscribers;
        self.cursors.retain(|(subject, group), _| {
            subscribers
                .iter()
                .any(|s| s.group == *group && subject_matches(&s.subject, subject))
        });
    }
}

fn spend_subscribe_budget(state: &mut BrokerState) -> Result<()> {
    match state.subscribe_budget.as_mut() {
        Some(0) => Err(TransportError::Subscribe(
            "subscription refused by broker".to_string(),
        )),
        Some(remaining) => {
            *remaining -= 1;
            Ok(())
        }
        None => Ok(()),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "connection refused: {}",
                options.url
            )));
        }

        self.shared
            .state
            .lock()
            .await
            .connections
            .push(options.clone());

        let id = self.shared.next_id();
        debug!(session = id, url = %options.url, "Memory broker session opened");

        Ok(Arc::new(MemorySession {
            id,
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session on a [`MemoryBroker`].
pub struct MemorySession {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("connection closed".to_string()));
        }
        Ok(())
    }

    fn shared(&self) -> &Shared {
        &self.broker.shared
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        if self.shared().refuse_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("publish refused by broker".to_string()));
        }

        let deliveries = {
            let mut state = self.shared().state.lock().await;
            let BrokerState {
                subscribers,
                cursors,
                ..
            } = &mut *state;

            let mut groups: BTreeMap<&str, Vec<&Subscriber>> = BTreeMap::new();
            for subscriber in subscribers.iter() {
                if subject_matches(&subscriber.subject, subject) {
                    groups.entry(subscriber.group.as_str()).or_default().push(subscriber);
                }
            }

            let mut deliveries = Vec::new();
            for (group, members) in groups {
                if group.is_empty() {
                    for member in members {
                        deliveries.push((Arc::clone(&member.callback), payload.clone()));
                    }
                    continue;
                }
                let cursor = cursors
                    .entry((subject.to_string(), group.to_string()))
                    .or_insert(0);
                let member = members[*cursor % members.len()];
                *cursor += 1;
                deliveries.push((Arc::clone(&member.callback), payload.clone()));
            }
            deliveries
        };

        debug!(subject = %subject, deliveries = deliveries.len(), "Memory broker publish");
        deliver(deliveries);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        self.broker.pass_gate().await?;

        let id = self.shared().next_id();
        let mut state = self.shared().state.lock().await;
        spend_subscribe_budget(&mut state)?;
        state.subscribers.push(Subscriber {
            id,
            session: self.id,
            subject: subject.to_string(),
            group: group.to_string(),
            callback: on_message,
        });

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.shared().state.lock().await.streams.contains_key(stream))
    }

    async fn create_stream(&self, stream: &str, subjects: Vec<String>) -> Result<()> {
        self.ensure_open()?;
        if self.shared().refuse_streams.load(Ordering::SeqCst) {
            return Err(TransportError::Stream(format!(
                "insufficient resources to create stream {}",
                stream
            )));
        }

        let mut state = self.shared().state.lock().await;
        if state.streams.contains_key(stream) {
            return Err(TransportError::Stream(format!(
                "stream name already in use: {}",
                stream
            )));
        }
        state.streams.insert(
            stream.to_string(),
            StreamState {
                subjects,
                consumers: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        if self.shared().refuse_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("publish refused by broker".to_string()));
        }

        let deliveries = {
            let mut state = self.shared().state.lock().await;
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.subjects.iter().any(|p| subject_matches(p, subject)))
                .ok_or_else(|| {
                    TransportError::Publish(format!("no stream captures subject {}", subject))
                })?;

            let mut deliveries = Vec::new();
            for consumer in stream.consumers.values_mut() {
                if !subject_matches(&consumer.filter, subject) {
                    continue;
                }
                if consumer.members.is_empty() {
                    consumer.pending.push_back(payload.clone());
                    continue;
                }
                let member = &consumer.members[consumer.next % consumer.members.len()];
                consumer.next += 1;
                deliveries.push((Arc::clone(&member.callback), payload.clone()));
            }
            deliveries
        };

        deliver(deliveries);
        Ok(())
    }

    async fn durable_queue_subscribe(
        &self,
        consumer: DurableSubscription<'_>,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        self.broker.pass_gate().await?;

        let id = self.shared().next_id();
        let backlog = {
            let mut state = self.shared().state.lock().await;
            spend_subscribe_budget(&mut state)?;
            let stream = state.streams.get_mut(consumer.stream).ok_or_else(|| {
                TransportError::Subscribe(format!("stream not found: {}", consumer.stream))
            })?;

            let durable = stream
                .consumers
                .entry(consumer.durable.to_string())
                .or_insert_with(|| DurableConsumer {
                    filter: consumer.subject.to_string(),
                    members: Vec::new(),
                    next: 0,
                    pending: VecDeque::new(),
                });

            if durable.filter != consumer.subject {
                return Err(TransportError::Subscribe(format!(
                    "consumer {} already bound to subject {}",
                    consumer.durable, durable.filter
                )));
            }

            durable.members.push(Member {
                id,
                session: self.id,
                callback: Arc::clone(&on_message),
            });
            durable.pending.drain(..).collect::<Vec<_>>()
        };

        deliver(
            backlog
                .into_iter()
                .map(|payload| (Arc::clone(&on_message), payload))
                .collect(),
        );

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.shared().state.lock().await;
        state.subscribers.retain(|s| s.session != self.id);
        state.prune_cursors();
        for stream in state.streams.values_mut() {
            for consumer in stream.consumers.values_mut() {
                consumer.members.retain(|m| m.session != self.id);
            }
        }
        debug!(session = self.id, "Memory broker session closed");
    }
}

/// Handle for a plain or durable subscription on a [`MemoryBroker`].
pub struct MemorySubscription {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let mut state = self.broker.shared.state.lock().await;
        state.subscribers.retain(|s| s.id != self.id);
        state.prune_cursors();
        for stream in state.streams.values_mut() {
            for consumer in stream.consumers.values_mut() {
                consumer.members.retain(|m| m.id != self.id);
            }
        }
        Ok(())
    }
}
