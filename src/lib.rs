//! # bunnyhop
//!
//! `bunnyhop` is the message-broker layer of an event-driven service. It keeps
//! a durable link to a topic broker, declares a fixed exchange/queue/binding
//! topology, publishes JSON events and consumes them with ack-based error
//! handling. A lost link is recovered through bounded, delayed reconnection.
//!
//! ## Core Modules
//!
//! - `broker`: the `MessageBroker` contract, the AMQP backend and a stub backend.
//! - `config`: loading settings from file and environment.
//! - `connection`: the supervisor owning the connection and channel.
//! - `consumer`: handler registry and per-queue consumers.
//! - `publisher`: serializing and submitting outbound messages.
//! - `topology`: exchange/queue/binding declarations and topic matching.
//! - `transport`: the wire seam, with a `lapin` implementation and an
//!   in-memory one for tests (`memory-transport` feature).
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod topology;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
