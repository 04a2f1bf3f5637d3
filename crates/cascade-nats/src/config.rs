//! Configuration for the NATS event bus.

use serde::Deserialize;
use std::time::Duration;

/// Subjects every Cascade event is published under.
pub const EVENT_SUBJECTS: [&str; 3] = ["build.>", "job.>", "trigger.>"];

/// Configuration for the NATS event bus.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URLs; more than one for a cluster.
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,

    /// JetStream stream holding scheduler events.
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Timeout for JetStream requests, publish acks included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delivery attempts per message for durable consumers.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,

    /// How long events stay in the stream.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_stream_name() -> String {
    "CASCADE_EVENTS".to_string()
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    5
}

fn default_max_deliver() -> i64 {
    3
}

fn default_max_age() -> u64 {
    86400 * 7
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_urls(),
            stream_name: default_stream_name(),
            connection_timeout_secs: default_connection_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_deliver: default_max_deliver(),
            max_age_secs: default_max_age(),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Accepts a comma-separated list, as found in `NATS_URL`.
    pub fn from_url_list(urls: &str) -> Self {
        Self {
            urls: urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}
