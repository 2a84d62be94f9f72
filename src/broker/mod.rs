//! Broker-agnostic contract and its backends.
//!
//! Callers depend on [`MessageBroker`] only. Two backends exist:
//!
//! - [`RabbitBroker`]: AMQP topic exchanges with supervised reconnection.
//! - [`StubBroker`]: a placeholder that fails what it cannot do, showing the
//!   contract does not assume a particular backend.
//!
//! A broker is built once at startup, shared as an `Arc` and closed once at
//! shutdown.

pub mod message;
pub mod rabbit;
pub mod stub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{BackendKind, Settings};
use crate::connection::HealthSnapshot;
use crate::consumer::EventHandler;
use crate::utils::error::BrokerError;

pub use rabbit::RabbitBroker;
pub use stub::StubBroker;

/// Health report for the operational layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HealthStatus {
    Connection(HealthSnapshot),
    #[serde(rename_all = "camelCase")]
    Unsupported { backend_name: String, status: String },
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Establish the link and provision topology. Fails if the broker is unreachable.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Start one consumer per configured queue with a registered handler.
    async fn start_consuming(&self) -> Result<(), BrokerError>;

    /// Bind a handler to a logical queue name. Last registration wins.
    fn register_event_handler(&self, queue: &str, handler: Arc<dyn EventHandler>);

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_ready(&self) -> bool;

    fn health_status(&self) -> HealthStatus;
}

/// Builds the backend selected by `settings.backend`.
pub fn create_broker(settings: &Settings) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    match settings.backend {
        BackendKind::Rabbitmq => Ok(Arc::new(RabbitBroker::new(settings)?)),
        BackendKind::Kafka => Ok(Arc::new(StubBroker::kafka())),
    }
}
