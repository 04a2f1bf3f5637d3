//! JetStream-backed event bus.

use async_nats::jetstream::{
    self, consumer::pull::Config as ConsumerConfig, stream::Config as StreamConfig,
};
use async_trait::async_trait;
use cascade_core::events::Event;
use cascade_core::ports::{EventBus, EventStream};
use cascade_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{EVENT_SUBJECTS, NatsConfig};
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;

/// Event bus publishing scheduler events to a JetStream stream.
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl NatsEventBus {
    /// Connect to a single server with default settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    /// Connect and make sure the event stream exists.
    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!(urls = %urls, stream = %config.stream_name, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.request_timeout()))
            .retry_on_initial_connect()
            .connect(&urls)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;

        let jetstream = jetstream::new(client.clone());

        let stream_config = StreamConfig {
            name: config.stream_name.clone(),
            subjects: EVENT_SUBJECTS.iter().map(|s| s.to_string()).collect(),
            retention: jetstream::stream::RetentionPolicy::Limits,
            max_age: config.max_age(),
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create stream: {}", e)))?;

        let metrics = NatsMetrics::new();
        metrics.set_connected(true);

        info!("Connected to NATS and initialized JetStream");

        Ok(Self {
            client,
            jetstream,
            config,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::evaluate(self.metrics.snapshot(), self.is_connected())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Subscribe through a durable consumer shared by every subscriber
    /// using the same `group`, so each event is handled once per group.
    pub async fn subscribe_durable(&self, pattern: &str, group: &str) -> Result<EventStream> {
        debug!(pattern, group, "Subscribing with durable consumer");
        self.consume(pattern, Some(group.to_string())).await
    }

    /// Stop publishing and drain the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Draining NATS connection");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.drain().await {
            error!(error = %e, "Error draining NATS connection");
        }

        self.metrics.set_connected(false);
        Ok(())
    }

    /// Message count of the event stream.
    pub async fn stream_messages(&self) -> Result<u64> {
        let mut stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream: {}", e)))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream info: {}", e)))?;

        Ok(info.state.messages)
    }

    async fn consume(&self, pattern: &str, durable_name: Option<String>) -> Result<EventStream> {
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                ConsumerConfig {
                    durable_name,
                    filter_subject: pattern.to_string(),
                    max_deliver: self.config.max_deliver,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
                &self.config.stream_name,
            )
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create consumer: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get messages: {}", e)))?;

        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();

        let stream = messages
            .take_while(move |_| futures::future::ready(!shutdown.load(Ordering::SeqCst)))
            .then(move |msg_result| {
                let metrics = metrics.clone();
                async move {
                    let msg = msg_result
                        .map_err(|e| Error::EventBus(format!("Message error: {}", e)))?;
                    metrics.record_receive(msg.payload.len() as u64);

                    let decoded = serde_json::from_slice::<Event>(&msg.payload);
                    if decoded.is_err() {
                        metrics.record_decode_failure();
                        warn!(subject = %msg.subject, "Undecodable event");
                    }

                    // Malformed payloads are acked too.
                    if let Err(e) = msg.ack().await {
                        warn!(error = %e, "Failed to ack event");
                    }

                    decoded.map_err(Error::from)
                }
            });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::EventBus(
                "Cannot publish: shutdown in progress".to_string(),
            ));
        }

        let subject = event.subject();
        let payload = serde_json::to_vec(&event)?;
        let payload_len = payload.len() as u64;

        let ack = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack) => ack,
            Err(e) => {
                self.metrics.record_publish_failure();
                return Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )));
            }
        };

        if let Err(e) = ack.await {
            self.metrics.record_publish_failure();
            return Err(Error::EventBus(format!("Failed to confirm publish: {}", e)));
        }

        self.metrics.record_publish(payload_len);
        debug!(subject = %subject, "Event published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!(pattern, "Subscribing");
        self.consume(pattern, None).await
    }
}
