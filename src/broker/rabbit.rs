use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::message::{OutboundMessage, PublishOptions};
use super::{HealthStatus, MessageBroker};
use crate::config::Settings;
use crate::connection::{ConnectionSupervisor, SupervisorConfig};
use crate::consumer::{ConsumerRunner, EventHandler, HandlerRegistry};
use crate::publisher::Publisher;
use crate::topology::Topology;
use crate::transport::{Connector, connector_for};
use crate::utils::error::BrokerError;

/// AMQP backend: supervisor + topology + publisher + consumers.
pub struct RabbitBroker {
    supervisor: ConnectionSupervisor,
    publisher: Publisher,
    consumers: Arc<ConsumerRunner>,
    registry: HandlerRegistry,
}

impl RabbitBroker {
    /// Picks the transport from the broker URL scheme.
    pub fn new(settings: &Settings) -> Result<Self, BrokerError> {
        let connector = connector_for(&settings.broker.url).map_err(BrokerError::StartupConnection)?;
        Self::with_connector(settings, connector)
    }

    pub fn with_connector(
        settings: &Settings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let topology = Topology::from_settings(&settings.topology, settings.broker.prefetch)?;
        let registry = HandlerRegistry::new();
        let consumers = Arc::new(ConsumerRunner::new(
            registry.clone(),
            topology.consumers.clone(),
        ));

        let supervisor = ConnectionSupervisor::new(
            SupervisorConfig::from(&settings.broker),
            connector,
            topology,
        );
        supervisor.set_resubscriber(consumers.clone());

        Ok(Self {
            publisher: Publisher::new(supervisor.clone()),
            supervisor,
            consumers,
            registry,
        })
    }

    /// See [`Publisher::publish`]. `false` when not connected.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish(exchange, routing_key, payload, options)
            .await
    }

    pub async fn publish_message<T: Serialize>(&self, message: &OutboundMessage<T>) -> bool {
        self.publisher.publish_message(message).await
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl MessageBroker for RabbitBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.supervisor.connect().await
    }

    async fn start_consuming(&self) -> Result<(), BrokerError> {
        let Some(channel) = self.supervisor.channel() else {
            warn!("Broker not ready, consumers not started");
            return Ok(());
        };
        self.consumers.start(channel).await
    }

    fn register_event_handler(&self, queue: &str, handler: Arc<dyn EventHandler>) {
        self.registry.register(queue, handler);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.supervisor.close().await
    }

    fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    fn health_status(&self) -> HealthStatus {
        HealthStatus::Connection(self.supervisor.health_snapshot())
    }
}
