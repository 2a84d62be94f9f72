//! The `consumer` module dispatches queue deliveries to business handlers.
//!
//! Each message walks Received → Decoded → Handled → Acked | Nacked. A failed
//! handler discards the message (nack, no requeue) so a deterministic failure
//! cannot loop forever.

pub mod registry;
pub mod runner;

pub use registry::{EventHandler, FnHandler, HandlerRegistry, handler_fn};
pub use runner::{ConsumerRunner, Outcome, process_delivery};
