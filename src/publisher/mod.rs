//! The `publisher` module submits messages on the supervisor's channel.
//!
//! `publish` reports local acceptance only: `true` means the message entered
//! the transport's send path, not that the broker stored it. It never fails
//! loudly; every problem becomes `false` plus a log line.

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::message::{OutboundMessage, PublishOptions};
use crate::connection::ConnectionSupervisor;

#[derive(Clone)]
pub struct Publisher {
    supervisor: ConnectionSupervisor,
}

impl Publisher {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self { supervisor }
    }

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
        let Some(channel) = self.supervisor.channel() else {
            warn!(exchange, routing_key, "Broker not ready, message not published");
            return false;
        };

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(exchange, routing_key, error = %e, "Failed to serialize message");
                return false;
            }
        };

        let properties = options.into_properties();
        let message_id = properties.message_id.clone().unwrap_or_default();

        match channel.publish(exchange, routing_key, body, properties).await {
            Ok(true) => {
                debug!(exchange, routing_key, message_id = %message_id, "Message published");
                true
            }
            Ok(false) => {
                warn!(exchange, routing_key, message_id = %message_id, "Publish buffer full, message not accepted");
                false
            }
            Err(e) => {
                error!(exchange, routing_key, message_id = %message_id, error = %e, "Failed to publish message");
                false
            }
        }
    }

    pub async fn publish_message<T: Serialize>(&self, message: &OutboundMessage<T>) -> bool {
        self.publish(
            &message.exchange,
            &message.routing_key,
            &message.payload,
            message.options.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests;
