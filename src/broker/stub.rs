use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{HealthStatus, MessageBroker};
use crate::consumer::{EventHandler, HandlerRegistry};
use crate::utils::error::BrokerError;

/// Backend that accepts handlers but cannot connect.
///
/// `connect` and `start_consuming` always fail with
/// [`BrokerError::NotImplemented`] rather than pretending to work.
pub struct StubBroker {
    name: &'static str,
    registry: HandlerRegistry,
}

impl StubBroker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: HandlerRegistry::new(),
        }
    }

    pub fn kafka() -> Self {
        Self::new("kafka")
    }

    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }

    fn not_implemented(&self, operation: &'static str) -> BrokerError {
        warn!(backend = self.name, operation, "Operation not implemented");
        BrokerError::NotImplemented {
            backend: self.name,
            operation,
        }
    }
}

#[async_trait]
impl MessageBroker for StubBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        Err(self.not_implemented("connect"))
    }

    async fn start_consuming(&self) -> Result<(), BrokerError> {
        Err(self.not_implemented("start_consuming"))
    }

    fn register_event_handler(&self, queue: &str, handler: Arc<dyn EventHandler>) {
        self.registry.register(queue, handler);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(backend = self.name, "Nothing to close");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn health_status(&self) -> HealthStatus {
        HealthStatus::Unsupported {
            backend_name: self.name.to_string(),
            status: "not_implemented".to_string(),
        }
    }
}
