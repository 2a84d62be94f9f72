use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{EventHandler, HandlerRegistry};
use crate::broker::message::{InboundMessage, resolve_correlation_id};
use crate::connection::Resubscribe;
use crate::topology::ConsumerSpec;
use crate::transport::{Channel, Delivery, DeliveryStream};
use crate::utils::error::{BrokerError, HandlerError};

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Discarded, never redelivered.
    Nacked,
    /// The ack or nack could not reach the broker (channel gone). The broker
    /// redelivers the message on its own.
    Unsettled,
}

/// Runs one consumer per configured queue, each bound to the handler
/// registered under the queue's logical name.
pub struct ConsumerRunner {
    registry: HandlerRegistry,
    consumers: Vec<ConsumerSpec>,
    started: AtomicBool,
    /// Channel the running consumers live on.
    active: Mutex<Option<Arc<dyn Channel>>>,
}

impl ConsumerRunner {
    pub fn new(registry: HandlerRegistry, consumers: Vec<ConsumerSpec>) -> Self {
        Self {
            registry,
            consumers,
            started: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Starts a consumer on `channel` for every queue with a registered handler.
    ///
    /// Consumers already running on the same channel are left alone.
    pub async fn start(&self, channel: Arc<dyn Channel>) -> Result<(), BrokerError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|current| Arc::ptr_eq(current, &channel)) {
            warn!("Consumers already running on this channel");
            return Ok(());
        }

        for spec in &self.consumers {
            let Some(handler) = self.registry.get(&spec.key) else {
                warn!(queue = %spec.queue, key = %spec.key, "No handler registered, queue not consumed");
                continue;
            };

            let subscription_error = |source| BrokerError::Subscription {
                queue: spec.queue.clone(),
                source,
            };
            // basic.qos applies to consumers started after it on this channel
            channel
                .set_prefetch(spec.prefetch)
                .await
                .map_err(subscription_error)?;
            let consumer_tag = format!("{}-{}", spec.queue, Uuid::new_v4());
            let stream = channel
                .consume(&spec.queue, &consumer_tag)
                .await
                .map_err(subscription_error)?;

            info!(queue = %spec.queue, prefetch = spec.prefetch, consumer_tag = %consumer_tag, "Consumer started");
            tokio::spawn(run_consumer(spec.clone(), handler, stream));
        }

        *active = Some(channel);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Resubscribe for ConsumerRunner {
    async fn resubscribe(&self, channel: Arc<dyn Channel>) -> Result<(), BrokerError> {
        if !self.is_started() {
            return Ok(());
        }
        info!("Restarting consumers after reconnection");
        self.start(channel).await
    }
}

/// Pulls deliveries and handles up to `prefetch` of them concurrently.
async fn run_consumer(spec: ConsumerSpec, handler: Arc<dyn EventHandler>, mut stream: DeliveryStream) {
    let permits = Arc::new(Semaphore::new(usize::from(spec.prefetch.max(1))));

    while let Some(item) = stream.next().await {
        let Some(delivery) = item else {
            warn!(queue = %spec.queue, "Received null delivery, consumer was cancelled by the broker");
            continue;
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        let queue = spec.queue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_delivery(&queue, handler.as_ref(), delivery).await;
        });
    }

    info!(queue = %spec.queue, "Consumer stopped");
}

/// Decode, handle, then ack on success or nack without requeue on failure.
pub async fn process_delivery(queue: &str, handler: &dyn EventHandler, delivery: Delivery) -> Outcome {
    let correlation_id = resolve_correlation_id(&delivery.properties);
    let message_id = delivery.properties.message_id.clone();

    let result = match serde_json::from_slice::<Value>(&delivery.body) {
        Ok(payload) => {
            let message = InboundMessage {
                queue: queue.to_string(),
                payload,
                correlation_id,
                message_id,
                delivery_tag: delivery.delivery_tag,
            };
            debug!(
                queue,
                message_id = ?message.message_id,
                correlation_id = %message.correlation_id,
                redelivered = delivery.redelivered,
                "Message received"
            );
            let handled = AssertUnwindSafe(
                handler.handle(message.payload.clone(), &message.correlation_id),
            )
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::failed(panic_reason(panic.as_ref()))));
            match handled {
                Ok(()) => Ok(message),
                Err(e) => Err((e, message.message_id, message.correlation_id)),
            }
        }
        Err(e) => Err((HandlerError::Decode(e), message_id, correlation_id)),
    };

    match result {
        Ok(message) => match delivery.ack().await {
            Ok(()) => {
                debug!(queue, message_id = ?message.message_id, correlation_id = %message.correlation_id, "Message acknowledged");
                Outcome::Acked
            }
            Err(e) => {
                warn!(queue, message_id = ?message.message_id, error = %e, "Failed to acknowledge message");
                Outcome::Unsettled
            }
        },
        Err((err, message_id, correlation_id)) => {
            error!(
                queue,
                message_id = ?message_id,
                correlation_id = %correlation_id,
                error = %err,
                "Handler failed, message discarded"
            );
            match delivery.nack(false).await {
                Ok(()) => Outcome::Nacked,
                Err(e) => {
                    warn!(queue, message_id = ?message_id, error = %e, "Failed to reject message");
                    Outcome::Unsettled
                }
            }
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("handler panicked: {detail}")
}
