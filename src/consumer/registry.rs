use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::error::HandlerError;

/// A business event handler supplied by the surrounding service.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Value, correlation_id: &str) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, payload: Value, correlation_id: &str) -> Result<(), HandlerError> {
        (self.0)(payload, correlation_id.to_string()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Value, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by logical queue name. Last registration for a key wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.insert(key.to_string(), handler).is_some() {
            warn!(key, "Event handler replaced");
        } else {
            debug!(key, "Event handler registered");
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
