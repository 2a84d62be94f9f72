//! Exchange, queue and binding declarations.
//!
//! [`TopologyManager::declare`] provisions a [`Topology`] on a live channel in
//! three strictly ordered phases: exchanges, then queues, then bindings.
//! Declarations inside one phase run concurrently. Every declaration is
//! idempotent; a conflicting redeclaration aborts the whole call.

pub mod pattern;

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::config::TopologySettings;
use crate::transport::Channel;
use crate::utils::error::{BrokerError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A queue to consume from, with its prefetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Logical name, also the handler registry key.
    pub key: String,
    pub queue: String,
    pub prefetch: u16,
}

/// Full routing structure of the service, resolved to physical names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
    pub consumers: Vec<ConsumerSpec>,
}

impl Topology {
    /// Resolves logical exchange names in bindings and fills in default prefetch.
    pub fn from_settings(
        settings: &TopologySettings,
        default_prefetch: u16,
    ) -> Result<Self, BrokerError> {
        let exchanges = settings
            .exchanges
            .values()
            .map(ExchangeSpec::topic)
            .collect();

        let mut queues = Vec::new();
        let mut bindings = Vec::new();
        let mut consumers = Vec::new();

        for (key, queue) in &settings.queues {
            queues.push(QueueSpec::durable(&queue.name));
            consumers.push(ConsumerSpec {
                key: key.clone(),
                queue: queue.name.clone(),
                prefetch: queue.prefetch.unwrap_or(default_prefetch),
            });

            for binding in &queue.bindings {
                let exchange = settings.exchanges.get(&binding.exchange).ok_or_else(|| {
                    BrokerError::Topology(TransportError::NotFound {
                        entity: "exchange",
                        name: binding.exchange.clone(),
                    })
                })?;
                bindings.push(BindingSpec {
                    queue: queue.name.clone(),
                    exchange: exchange.clone(),
                    routing_key: binding.routing_key.clone(),
                });
            }
        }

        Ok(Self {
            exchanges,
            queues,
            bindings,
            consumers,
        })
    }

    /// Consumer definition for a logical queue name.
    pub fn consumer(&self, key: &str) -> Option<&ConsumerSpec> {
        self.consumers.iter().find(|c| c.key == key)
    }
}

pub struct TopologyManager;

impl TopologyManager {
    pub async fn declare(channel: &dyn Channel, topology: &Topology) -> Result<(), BrokerError> {
        try_join_all(
            topology
                .exchanges
                .iter()
                .map(|exchange| channel.declare_exchange(exchange)),
        )
        .await
        .map_err(declaration_error)?;
        debug!(count = topology.exchanges.len(), "Exchanges declared");

        try_join_all(topology.queues.iter().map(|queue| channel.declare_queue(queue)))
            .await
            .map_err(declaration_error)?;
        debug!(count = topology.queues.len(), "Queues declared");

        try_join_all(
            topology
                .bindings
                .iter()
                .map(|binding| channel.bind_queue(binding)),
        )
        .await
        .map_err(declaration_error)?;

        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }
}

fn declaration_error(err: TransportError) -> BrokerError {
    match err {
        TransportError::Conflict { .. } => BrokerError::TopologyConflict(err),
        other => BrokerError::Topology(other),
    }
}
