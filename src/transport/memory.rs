//! In-process broker with AMQP-like semantics.
//!
//! Supports topic/direct/fanout routing, durable declaration conflict checks,
//! per-consumer prefetch, unacked tracking and redelivery of unacked messages
//! when a channel goes away. Failure can be injected for testing: refuse new
//! connections, sever live ones, block publishing or cancel consumers.
//!
//! State lives behind a `std::sync::Mutex`; no lock is held across an await.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    Acker, Channel, Connection, Connector, Delivery, DeliveryStream, LifecycleEvent,
    LifecycleReceiver, MessageProperties,
};
use crate::topology::pattern;
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::utils::error::TransportError;

const EVENT_CAPACITY: usize = 16;

/// Counters exposed for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connect_attempts: usize,
    pub connections_opened: usize,
    pub published: usize,
    pub acked: usize,
    pub nacked: usize,
    pub requeued: usize,
}

/// Handle to a shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    blocked: bool,
    fail_publishes: bool,
    next_id: u64,
    next_tag: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    connections: HashMap<u64, broadcast::Sender<LifecycleEvent>>,
    channels: HashMap<u64, ChannelState>,
    stats: MemoryStats,
}

struct ChannelState {
    connection: u64,
    events: broadcast::Sender<LifecycleEvent>,
    prefetch: u16,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Envelope {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Unacked {
    envelope: Envelope,
    consumer: u64,
}

struct ConsumerState {
    id: u64,
    channel: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Option<Delivery>>,
}

enum Settle {
    Ack,
    Nack { requeue: bool },
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn closed_receiver() -> LifecycleReceiver {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> Result<&ChannelState, TransportError> {
        self.channels
            .get(&channel)
            .ok_or(TransportError::ChannelClosed)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>, TransportError> {
        // default exchange routes straight to the queue named by the key
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound {
                entity: "exchange",
                name: exchange.to_string(),
            })?;

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match spec.kind {
                ExchangeKind::Topic => pattern::matches(&b.routing_key, routing_key),
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect())
    }

    fn enqueue(&mut self, queue: &str, envelope: Envelope, weak: &Weak<Mutex<BrokerState>>) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(envelope);
        }
        self.dispatch(queue, weak);
    }

    /// Hands ready messages to consumers with spare prefetch capacity, round robin.
    fn dispatch(&mut self, queue: &str, weak: &Weak<Mutex<BrokerState>>) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let count = q.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (q.next_consumer + offset) % count)
                .find(|&i| {
                    let c = &q.consumers[i];
                    c.prefetch == 0 || c.in_flight < usize::from(c.prefetch)
                })
            else {
                break;
            };
            let Some(envelope) = q.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery::new(
                tag,
                envelope.redelivered,
                envelope.body.clone(),
                envelope.properties.clone(),
                Box::new(MemoryAcker {
                    state: weak.clone(),
                    queue: queue.to_string(),
                    tag,
                }),
            );

            let consumer = &mut q.consumers[idx];
            if consumer.sender.send(Some(delivery)).is_err() {
                // receiver dropped, consumer is gone
                q.ready.push_front(envelope);
                let gone = q.consumers.remove(idx);
                requeue_consumer(q, gone.id);
                q.next_consumer = 0;
                continue;
            }
            consumer.in_flight += 1;
            let consumer = consumer.id;
            q.unacked.insert(tag, Unacked { envelope, consumer });
            q.next_consumer = (idx + 1) % count;
        }
    }

    fn settle(
        &mut self,
        queue: &str,
        tag: u64,
        outcome: Settle,
        weak: &Weak<Mutex<BrokerState>>,
    ) -> Result<(), TransportError> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or(TransportError::ChannelClosed)?;
        let unacked = q
            .unacked
            .remove(&tag)
            .ok_or_else(|| TransportError::Protocol(format!("unknown delivery tag {tag}")))?;

        if let Some(c) = q.consumers.iter_mut().find(|c| c.id == unacked.consumer) {
            c.in_flight = c.in_flight.saturating_sub(1);
        }

        match outcome {
            Settle::Ack => self.stats.acked += 1,
            Settle::Nack { requeue: false } => self.stats.nacked += 1,
            Settle::Nack { requeue: true } => {
                self.stats.requeued += 1;
                let mut envelope = unacked.envelope;
                envelope.redelivered = true;
                q.ready.push_front(envelope);
            }
        }

        self.dispatch(queue, weak);
        Ok(())
    }

    /// Drops a channel and its consumers; their unacked messages go back to the queue.
    fn remove_channel(
        &mut self,
        channel: u64,
        event: Option<&LifecycleEvent>,
        weak: &Weak<Mutex<BrokerState>>,
    ) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        if let Some(event) = event {
            let _ = state.events.send(event.clone());
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if let Some(q) = self.queues.get_mut(&name) {
                let (gone, kept): (Vec<_>, Vec<_>) =
                    q.consumers.drain(..).partition(|c| c.channel == channel);
                q.consumers = kept;
                q.next_consumer = 0;
                for consumer in gone {
                    debug!(queue = %name, consumer_tag = %consumer.tag, "Consumer removed");
                    requeue_consumer(q, consumer.id);
                }
            }
            self.dispatch(&name, weak);
        }
    }

    fn remove_connection(
        &mut self,
        connection: u64,
        event: Option<&LifecycleEvent>,
        weak: &Weak<Mutex<BrokerState>>,
    ) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.remove_channel(channel, event, weak);
        }
        if let Some(events) = self.connections.remove(&connection) {
            if let Some(event) = event {
                let _ = events.send(event.clone());
            }
        }
    }
}

fn requeue_consumer(q: &mut QueueState, consumer: u64) {
    let mut tags: Vec<u64> = q
        .unacked
        .iter()
        .filter(|(_, u)| u.consumer == consumer)
        .map(|(tag, _)| *tag)
        .collect();
    // oldest first ends up at the front
    tags.sort_unstable_by(|a, b| b.cmp(a));
    for tag in tags {
        if let Some(unacked) = q.unacked.remove(&tag) {
            let mut envelope = unacked.envelope;
            envelope.redelivered = true;
            q.ready.push_front(envelope);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    fn weak(&self) -> Weak<Mutex<BrokerState>> {
        Arc::downgrade(&self.state)
    }

    /// A connector opening links to this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// When false, new connections are refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().refuse_connections = !reachable;
    }

    /// When true, publishes are not accepted (`Ok(false)`).
    pub fn set_blocked(&self, blocked: bool) {
        self.lock().blocked = blocked;
    }

    /// When true, publishes fail with a protocol error.
    pub fn set_publish_failure(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Closes every live connection as if the network dropped.
    pub fn drop_connections(&self) {
        self.sever(LifecycleEvent::Closed);
    }

    /// Fails every live connection with an error event.
    pub fn fail_connections(&self, reason: &str) {
        self.sever(LifecycleEvent::Error(reason.to_string()));
    }

    fn sever(&self, event: LifecycleEvent) {
        let weak = self.weak();
        let mut state = self.lock();
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            state.remove_connection(connection, Some(&event), &weak);
        }
    }

    /// Server-side consumer cancel: each consumer of `queue` gets a null delivery.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            let consumers: Vec<ConsumerState> = q.consumers.drain(..).collect();
            q.next_consumer = 0;
            for consumer in consumers {
                let _ = consumer.sender.send(None);
                requeue_consumer(q, consumer.id);
            }
        }
    }

    /// Publishes as another client would, bypassing any channel.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        let weak = self.weak();
        let mut state = self.lock();
        let targets = state.route(exchange, routing_key)?;
        state.stats.published += 1;
        let envelope = Envelope {
            body: body.into(),
            properties,
            redelivered: false,
        };
        for queue in targets {
            state.enqueue(&queue, envelope.clone(), &weak);
        }
        Ok(())
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }
}

/// [`Connector`] for a [`MemoryBroker`]; ignores the URL beyond logging it.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = self.broker.lock();
        state.stats.connect_attempts += 1;
        if state.refuse_connections {
            return Err(TransportError::Unreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let id = state.next_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.connections.insert(id, events);
        state.stats.connections_opened += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::ChannelClosed);
        }
        let id = state.next_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                events,
                prefetch: 0,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn lifecycle(&self) -> LifecycleReceiver {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .map_or_else(closed_receiver, |events| events.subscribe())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let weak = self.broker.weak();
        self.broker.lock().remove_connection(self.id, None, &weak);
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        if let Some(existing) = state.exchanges.get(&spec.name) {
            return if existing == spec {
                Ok(())
            } else {
                Err(TransportError::Conflict {
                    entity: "exchange",
                    name: spec.name.clone(),
                })
            };
        }
        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        if let Some(existing) = state.queues.get(&spec.name) {
            return if existing.spec == *spec {
                Ok(())
            } else {
                Err(TransportError::Conflict {
                    entity: "queue",
                    name: spec.name.clone(),
                })
            };
        }
        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        if !state.queues.contains_key(&spec.queue) {
            return Err(TransportError::NotFound {
                entity: "queue",
                name: spec.queue.clone(),
            });
        }
        if !state.exchanges.contains_key(&spec.exchange) {
            return Err(TransportError::NotFound {
                entity: "exchange",
                name: spec.exchange.clone(),
            });
        }
        if !state.bindings.contains(spec) {
            state.bindings.push(spec.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        let weak = self.broker.weak();
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        if state.fail_publishes {
            return Err(TransportError::Protocol("publish rejected".to_string()));
        }
        if state.blocked {
            return Ok(false);
        }

        let targets = state.route(exchange, routing_key)?;
        state.stats.published += 1;
        let envelope = Envelope {
            body,
            properties,
            redelivered: false,
        };
        for queue in targets {
            state.enqueue(&queue, envelope.clone(), &weak);
        }
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let weak = self.broker.weak();
        let mut state = self.broker.lock();
        let prefetch = state.ensure_channel(self.id)?.prefetch;
        let id = state.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound {
                entity: "queue",
                name: queue.to_string(),
            })?;
        q.consumers.push(ConsumerState {
            id,
            channel: self.id,
            tag: consumer_tag.to_string(),
            prefetch,
            in_flight: 0,
            sender,
        });
        state.dispatch(queue, &weak);

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    fn lifecycle(&self) -> LifecycleReceiver {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .map_or_else(closed_receiver, |c| c.events.subscribe())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let weak = self.broker.weak();
        self.broker.lock().remove_channel(self.id, None, &weak);
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), TransportError> {
        let state = self.state.upgrade().ok_or(TransportError::ChannelClosed)?;
        let mut guard = lock(&state);
        guard.settle(&self.queue, self.tag, outcome, &self.state)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Settle::Nack { requeue })
    }
}
