use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::transport::{CORRELATION_HEADER, MessageProperties};

/// Per-publish overrides. Unset fields fall back to the defaults:
/// persistent, timestamped now, fresh UUID message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: Option<bool>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Merges these options over the defaults.
    ///
    /// A correlation id is carried both as the property and as the
    /// `x-correlation-id` header so consumers reading either find it.
    pub fn into_properties(self) -> MessageProperties {
        let mut headers = self.headers;
        if let Some(id) = &self.correlation_id {
            headers
                .entry(CORRELATION_HEADER.to_string())
                .or_insert_with(|| id.clone());
        }

        MessageProperties {
            persistent: self.persistent.unwrap_or(true),
            timestamp: Some(self.timestamp.unwrap_or_else(now_secs)),
            message_id: Some(
                self.message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            correlation_id: self.correlation_id,
            content_type: Some(
                self.content_type
                    .unwrap_or_else(|| "application/json".to_string()),
            ),
            headers,
        }
    }
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// A message to publish on an exchange.
///
/// ```rust
/// use bunnyhop::broker::message::{OutboundMessage, PublishOptions};
///
/// let msg = OutboundMessage {
///     exchange: "reviews".to_string(),
///     routing_key: "review.created".to_string(),
///     payload: serde_json::json!({ "reviewId": "r1" }),
///     options: PublishOptions::default(),
/// };
/// assert_eq!(msg.routing_key, "review.created");
/// ```
#[derive(Debug, Clone)]
pub struct OutboundMessage<T: Serialize> {
    pub exchange: String,
    pub routing_key: String,
    pub payload: T,
    pub options: PublishOptions,
}

/// A decoded message as seen by the consumer runner.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub queue: String,
    pub payload: Value,
    pub correlation_id: String,
    pub message_id: Option<String>,
    pub delivery_tag: u64,
}

/// Correlation id of an incoming message: the property, else the
/// `x-correlation-id` header, else a fresh UUID. Never empty.
pub fn resolve_correlation_id(properties: &MessageProperties) -> String {
    properties
        .correlation_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .or_else(|| {
            properties
                .headers
                .get(CORRELATION_HEADER)
                .map(String::as_str)
                .filter(|id| !id.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
