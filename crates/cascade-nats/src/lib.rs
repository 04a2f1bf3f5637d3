//! NATS event bus for Cascade.
//!
//! Scheduler events are published to a JetStream stream so that consumers
//! outside the process (notifiers, UIs, audit) can follow builds.

mod bus;
pub mod config;
pub mod health;
pub mod metrics;

pub use bus::NatsEventBus;
pub use config::NatsConfig;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsSnapshot, NatsMetrics};
