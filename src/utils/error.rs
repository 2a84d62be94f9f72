//! The `error` module defines the error types shared across `bunnyhop`.
//!
//! Startup failures (`StartupConnection`, `TopologyConflict`) are returned to
//! the caller that owns process bootstrap. Link loss after startup is handled
//! internally by the connection supervisor and only ever logged.

use thiserror::Error;

/// Errors raised by the transport layer (AMQP client or in-memory broker).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("unsupported broker url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("{entity} '{name}' already declared with different parameters")]
    Conflict { entity: &'static str, name: String },

    #[error("{entity} '{name}' not found")]
    NotFound { entity: &'static str, name: String },

    #[error("channel is closed")]
    ChannelClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by a [`MessageBroker`](crate::broker::MessageBroker) backend.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Initial connect failed. Fatal to startup, never retried.
    #[error("failed to connect to broker: {0}")]
    StartupConnection(#[source] TransportError),

    /// The link dropped or a reconnect attempt failed after startup.
    #[error("broker connection lost: {0}")]
    TransientConnection(#[source] TransportError),

    /// Declared topology does not match what the broker already holds.
    #[error("topology conflict: {0}")]
    TopologyConflict(#[source] TransportError),

    /// A declaration failed for a reason other than a parameter conflict.
    #[error("topology declaration failed: {0}")]
    Topology(#[source] TransportError),

    /// A consumer could not be started on a queue.
    #[error("failed to start consumer on '{queue}': {source}")]
    Subscription {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("{backend} backend: {operation} is not implemented, use the rabbitmq backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },
}

impl BrokerError {
    /// Reclassifies a connect failure as a loss after startup. Other kinds pass through.
    pub fn into_transient(self) -> Self {
        match self {
            Self::StartupConnection(source) => Self::TransientConnection(source),
            other => other,
        }
    }
}

/// Failure returned by a business event handler.
///
/// Any handler failure results in the message being discarded (nack without
/// requeue).
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
