//! Commit notifications
//!
//! A broadcast channel carries "saved unit" and non-fatal error events to
//! any number of subscribers. Callers that need one specific unit register
//! a one-shot waiter instead. Nothing is published for a rolled back unit.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::joint::Joint;

/// Events emitted by the writer
#[derive(Debug, Clone)]
pub enum WriterEvent {
    /// A unit was committed
    SavedUnit { joint: Arc<Joint> },
    /// A recomputed metric disagreed with the validator under the report policy
    NonfatalError { unit: String, message: String },
}

/// Event bus for commit notifications
pub struct EventBus {
    sender: broadcast::Sender<WriterEvent>,
    waiters: DashMap<String, Vec<oneshot::Sender<Arc<Joint>>>>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            waiters: DashMap::new(),
        }
    }

    pub fn emit(&self, event: WriterEvent) {
        trace!(event = ?event, "Emitting writer event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Notify the waiters of this unit, then everyone else
    pub fn emit_saved(&self, joint: Arc<Joint>) {
        if let Some((_, waiters)) = self.waiters.remove(&joint.unit.unit) {
            debug!(unit = %joint.unit.unit, count = waiters.len(), "Waking unit waiters");
            for waiter in waiters {
                let _ = waiter.send(joint.clone());
            }
        }
        self.emit(WriterEvent::SavedUnit { joint });
    }

    pub fn emit_nonfatal(&self, unit: &str, message: String) {
        warn!(unit = %unit, message = %message, "Non-fatal writer error");
        self.emit(WriterEvent::NonfatalError {
            unit: unit.to_string(),
            message,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WriterEvent> {
        self.sender.subscribe()
    }

    /// Resolves with the joint once `unit` is committed.
    ///
    /// The receiver errors if the bus is dropped first.
    pub fn wait_for_unit(&self, unit: &str) -> oneshot::Receiver<Arc<Joint>> {
        self.prune_waiters();
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(unit.to_string()).or_default().push(tx);
        rx
    }

    /// Drop waiters whose receiver is gone, for units that may never commit
    fn prune_waiters(&self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|waiter| !waiter.is_closed());
            !waiters.is_empty()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn pending_waiters(&self, unit: &str) -> usize {
        self.waiters.get(unit).map(|w| w.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(WriterEvent::SavedUnit { joint }) => {
                    debug!(unit = %joint.unit.unit, "Saved unit");
                }
                Ok(WriterEvent::NonfatalError { unit, message }) => {
                    debug!(unit = %unit, message = %message, "Non-fatal error event");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn joint(unit: &str) -> Arc<Joint> {
        Arc::new(
            serde_json::from_value(json!({
                "unit": {"unit": unit, "version": "1.0", "alt": "1", "authors": [{"address": "A"}]}
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_saved_unit_reaches_waiter_and_subscriber() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        let waiter = bus.wait_for_unit("U1");
        let other = bus.wait_for_unit("U2");

        bus.emit_saved(joint("U1"));

        let saved = timeout(Duration::from_millis(100), waiter)
            .await
            .expect("timeout")
            .expect("waiter dropped");
        assert_eq!(saved.unit.unit, "U1");

        match timeout(Duration::from_millis(100), receiver.recv()).await {
            Ok(Ok(WriterEvent::SavedUnit { joint })) => assert_eq!(joint.unit.unit, "U1"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(bus.pending_waiters("U1"), 0);
        assert_eq!(bus.pending_waiters("U2"), 1);
        drop(other);
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let bus = EventBus::new();
        let abandoned = bus.wait_for_unit("NEVER");
        let kept = bus.wait_for_unit("NEVER");
        drop(abandoned);

        let _other = bus.wait_for_unit("U3");
        assert_eq!(bus.pending_waiters("NEVER"), 1);

        drop(kept);
        let _another = bus.wait_for_unit("U4");
        assert_eq!(bus.pending_waiters("NEVER"), 0);
        assert_eq!(bus.pending_waiters("U3"), 1);
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        bus.emit_nonfatal("U", "different levels".into());
    }
}
