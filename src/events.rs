// =============================================================================
// Event Bus — fan-out of decisions, alarms, and status to live subscribers
// =============================================================================
//
// Subscribers are WebSocket connections (or tests) holding the receive half
// of an mpsc channel; `broadcast` clones the event to every live sender and
// prunes any that fail (the peer disconnected) rather than erroring. The
// subscriber set itself is a vector behind a lock, snapshotted before a
// broadcast so a slow or panicking sink can't hold the lock across sends.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::Decision;

/// Identifier shown to the operator: the decoded QR when available, else
/// the raw EPC — whichever the viewer would actually recognise.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    TagDetected {
        tag_id: String,
        rssi: Option<f64>,
        antenna: Option<i64>,
        decision: Decision,
        timestamp: DateTime<Utc>,
    },
    AlarmTriggered {
        tag_id: String,
        gate_id: String,
        rssi: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    CommandResponse {
        command: Option<String>,
        action: Option<String>,
        status: Option<String>,
        message: Option<String>,
        data: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    ReaderStatus {
        status: Option<String>,
        uptime: Option<i64>,
        memory: Option<i64>,
        antennas: Option<serde_json::Value>,
        network: Option<serde_json::Value>,
        system: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    StatusUpdate {
        mqtt_connected: bool,
        in_cart_count: i64,
        paid_count: i64,
    },
}

type Sink = mpsc::UnboundedSender<Event>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sink>>,
}

pub struct Subscription {
    pub receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return the receiving half.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Subscription { receiver: rx }
    }

    /// Current number of live subscribers (best-effort; a send-failed
    /// subscriber is pruned lazily on the next broadcast).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Send `event` to every live subscriber, dropping any whose receiver
    /// has gone away.
    pub fn broadcast(&self, event: Event) {
        let snapshot: Vec<Sink> = self.subscribers.lock().clone();
        if snapshot.is_empty() {
            return;
        }

        for sink in &snapshot {
            let _ = sink.send(event.clone());
        }

        // Prune by liveness, not position: concurrent broadcasts each take
        // their own snapshot, so removing by index would let one call's
        // shifted indices delete another call's still-live subscriber.
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| !s.is_closed());
        let pruned = before - subscribers.len();
        if pruned > 0 {
            debug!(pruned, "pruned dead event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(connected: bool) -> Event {
        Event::StatusUpdate {
            mqtt_connected: connected,
            in_cart_count: 0,
            paid_count: 0,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut s1 = bus.subscribe();
        let mut s2 = bus.subscribe();

        bus.broadcast(status(true));

        let e1 = s1.receiver.recv().await.unwrap();
        let e2 = s2.receiver.recv().await.unwrap();
        assert!(matches!(e1, Event::StatusUpdate { mqtt_connected: true, .. }));
        assert!(matches!(e2, Event::StatusUpdate { mqtt_connected: true, .. }));
    }

    #[tokio::test]
    async fn broadcast_prunes_dropped_subscribers() {
        let bus = EventBus::new();
        {
            let _dropped = bus.subscribe();
        } // receiver dropped immediately
        assert_eq!(bus.subscriber_count(), 1);

        bus.broadcast(status(false));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_with_no_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.broadcast(status(true));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
