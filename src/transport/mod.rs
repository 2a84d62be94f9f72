//! The `transport` module is the seam between broker logic and the wire.
//!
//! The connection supervisor, topology manager, publisher and consumer runner
//! only talk to the [`Connector`], [`Connection`] and [`Channel`] traits.
//! Two implementations exist:
//!
//! - `amqp`: a real AMQP 0-9-1 link built on `lapin`.
//! - `memory`: an in-process broker with topic routing and failure
//!   injection, for tests (`memory://` URLs). Compiled for the crate's own
//!   tests and behind the `memory-transport` feature; it is not a production
//!   backend.
//!
//! Failure is reported through a lifecycle event channel on every connection
//! and channel handle rather than through callbacks.

pub mod amqp;
#[cfg(any(test, feature = "memory-transport"))]
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::utils::error::TransportError;

pub use amqp::AmqpConnector;
#[cfg(any(test, feature = "memory-transport"))]
pub use memory::{MemoryBroker, MemoryConnector};

/// Header carrying the correlation id when the property is not set.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Something went wrong with a live connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Error(String),
    Closed,
}

pub type LifecycleReceiver = broadcast::Receiver<LifecycleEvent>;

/// Items yielded by a consumer. `None` is a null delivery, sent by the broker
/// when it cancels the consumer.
pub type DeliveryStream = BoxStream<'static, Option<Delivery>>;

/// Wire-level metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message handed to a consumer, awaiting ack or nack.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        properties: MessageProperties,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .finish()
    }
}

/// Opens transport-level links to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Subscribe to error/close notifications for this connection.
    fn lifecycle(&self) -> LifecycleReceiver;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Session over a connection. All publish and consume traffic goes through it.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError>;

    /// Max unacknowledged deliveries for consumers started after this call.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Hand a message to the local send path.
    ///
    /// `Ok(false)` means the transport is applying backpressure; the message
    /// was not accepted.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    fn lifecycle(&self) -> LifecycleReceiver;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Picks a connector from the URL scheme.
pub fn connector_for(url: &str) -> Result<Arc<dyn Connector>, TransportError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");
    match scheme {
        "amqp" | "amqps" => Ok(Arc::new(AmqpConnector)),
        #[cfg(any(test, feature = "memory-transport"))]
        "memory" => Ok(Arc::new(MemoryConnector::new(MemoryBroker::new()))),
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests;
