//! The `connection` module owns the broker link.
//!
//! [`ConnectionSupervisor`] holds the only connection/channel pair, provisions
//! topology on every connect, watches lifecycle events and drives bounded,
//! delayed reconnection after a post-startup failure.

pub mod supervisor;

pub use supervisor::{ConnectionSupervisor, HealthSnapshot, Resubscribe, SupervisorConfig};
