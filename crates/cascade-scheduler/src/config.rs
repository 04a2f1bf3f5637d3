//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two stale-job sweeps.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// A running job with no log line for this long is killed.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Capacity of the event queue between persistence and the bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Terminal builds kept per (application, pipeline, environment, branch).
    #[serde(default = "default_history_retention")]
    pub history_retention: u32,
    /// Lifetime of the lease taken while cascading a finished build.
    #[serde(default = "default_cascade_lease")]
    pub cascade_lease_secs: u64,
    /// Owner name this replica uses for leases.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    15 * 60
}

fn default_event_buffer() -> usize {
    1024
}

fn default_history_retention() -> u32 {
    50
}

fn default_cascade_lease() -> u64 {
    30
}

fn default_instance_id() -> String {
    format!("cascade-{}", uuid::Uuid::new_v4().simple())
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            stale_after_secs: default_stale_after(),
            event_buffer: default_event_buffer(),
            history_retention: default_history_retention(),
            cascade_lease_secs: default_cascade_lease(),
            instance_id: default_instance_id(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, std::io::Error> {
        serde_yaml::from_str(contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn cascade_lease(&self) -> Duration {
        Duration::from_secs(self.cascade_lease_secs)
    }
}
