//! Health of the event bus connection.

use crate::metrics::MetricsSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Connected, but events were lost or unreadable.
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub metrics: MetricsSnapshot,
}

impl HealthCheck {
    pub fn evaluate(metrics: MetricsSnapshot, connected: bool) -> Self {
        let status = if !connected {
            HealthStatus::Unhealthy {
                reason: "not connected to NATS".to_string(),
            }
        } else if metrics.publish_failures > 0 || metrics.decode_failures > 0 {
            HealthStatus::Degraded {
                reason: format!(
                    "{} publish failures, {} undecodable messages",
                    metrics.publish_failures, metrics.decode_failures
                ),
            }
        } else {
            HealthStatus::Healthy
        };

        Self { status, metrics }
    }
}
