//! Decoupled event emission.
//!
//! Managers persist first and then hand events to an [`EventPublisher`],
//! which never blocks and never fails the caller. The [`EventDispatcher`]
//! task drains the queue into the configured [`EventBus`].

use cascade_core::events::Event;
use cascade_core::ports::EventBus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Cheap handle for queueing events.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Queue an event. A full or closed queue drops it with a warning.
    pub fn emit(&self, event: Event) {
        let subject = event.subject();
        match self.tx.try_send(event) {
            Ok(()) => debug!(subject = %subject, "Event queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.record_drop();
                warn!(subject = %subject, dropped, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let dropped = self.record_drop();
                warn!(subject = %subject, dropped, "Event dispatcher stopped, dropping event");
            }
        }
    }

    /// Events dropped so far by this publisher and its clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Background task forwarding queued events to the bus.
pub struct EventDispatcher {
    rx: mpsc::Receiver<Event>,
    bus: Arc<dyn EventBus>,
}

/// Create a publisher and the dispatcher draining it.
pub fn event_channel(bus: Arc<dyn EventBus>, capacity: usize) -> (EventPublisher, EventDispatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let publisher = EventPublisher {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (publisher, EventDispatcher { rx, bus })
}

impl EventDispatcher {
    /// Forward events until shutdown, then flush what is already queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting event dispatcher");

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.forward(event).await,
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        let mut flushed = 0usize;
        while let Some(event) = self.rx.recv().await {
            self.forward(event).await;
            flushed += 1;
        }
        info!(flushed, "Event dispatcher stopped");
    }

    #[cfg(test)]
    pub(crate) fn drain_queued(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            drained.push(event);
        }
        drained
    }

    async fn forward(&self, event: Event) {
        let subject = event.subject();
        if let Err(e) = self.bus.publish(event).await {
            error!(subject = %subject, error = %e, "Failed to publish event");
        }
    }
}
