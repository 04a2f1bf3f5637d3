//! In-process event bus for single-node deployments and tests.

use async_trait::async_trait;
use cascade_core::events::Event;
use cascade_core::ports::{EventBus, EventStream};
use cascade_core::{Error, Result};
use futures::stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcasts every event to all live subscribers.
#[derive(Clone)]
pub struct InProcessEventBus {
    tx: broadcast::Sender<Event>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// NATS-style subject matching: `*` matches one token, `>` the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for p in pattern.split('.') {
        match (p, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (p, Some(s)) if p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        // No subscribers is not an error.
        let delivered = self.tx.send(event).unwrap_or(0);
        debug!(delivered, "Event broadcast");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        if pattern.is_empty() {
            return Err(Error::EventBus("empty subscription pattern".to_string()));
        }

        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();

        let events = stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if subject_matches(&pattern, &event.subject()) => {
                        return Some((Ok(event), (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, pattern = %pattern, "Subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(events))
    }
}
