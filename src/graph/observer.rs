//! Observer hub: process-local fan-out of graph change events.
//!
//! Grounded on the worker pool's backpressure idiom (atomics for
//! lock-free counters) combined with a bounded `mpsc` channel per
//! observer: `try_send` gives exactly the non-blocking "drop on full"
//! semantics the distilled spec calls for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use super::{EdgeType, NodeState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeAdded {
        app: String,
        node_id: String,
        state: NodeState,
    },
    NodeStateChanged {
        app: String,
        node_id: String,
        state: NodeState,
    },
    EdgeAdded {
        app: String,
        edge_id: String,
        from_node_id: String,
        to_node_id: String,
        edge_type: EdgeType,
    },
}

struct Observer {
    id: u64,
    sender: mpsc::Sender<GraphEvent>,
}

/// Handle returned by `add_observer`; pass back to `remove_observer`.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: u64,
}

pub struct ObserverHub {
    buffer_size: usize,
    next_id: AtomicU64,
    observers: parking_lot::RwLock<Vec<Observer>>,
}

impl ObserverHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            next_id: AtomicU64::new(0),
            observers: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Registers an observer and returns its handle plus the receiver
    /// side of its bounded channel.
    pub fn subscribe(&self) -> (ObserverHandle, mpsc::Receiver<GraphEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        self.observers.write().push(Observer { id, sender });
        (ObserverHandle { id }, receiver)
    }

    pub fn remove_observer(&self, handle: &ObserverHandle) {
        self.observers.write().retain(|o| o.id != handle.id);
    }

    /// Dispatches to a snapshot of the observer set without holding any
    /// mutation lock. A slow consumer (its buffer still full on this
    /// event) is dropped from the observer set entirely, with a warning,
    /// rather than just losing the one event.
    pub fn notify(&self, event: GraphEvent) {
        let snapshot: Vec<(u64, mpsc::Sender<GraphEvent>)> = self
            .observers
            .read()
            .iter()
            .map(|o| (o.id, o.sender.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(observer_id = id, "slow observer, dropping it");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.observers.write().retain(|o| !dead.contains(&o.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events() {
        let hub = ObserverHub::new(4);
        let (_handle, mut rx) = hub.subscribe();
        hub.notify(GraphEvent::NodeAdded {
            app: "app".into(),
            node_id: "n1".into(),
            state: NodeState::Waiting,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, GraphEvent::NodeAdded { .. }));
    }

    #[tokio::test]
    async fn removed_observer_stops_receiving() {
        let hub = ObserverHub::new(4);
        let (handle, mut rx) = hub.subscribe();
        hub.remove_observer(&handle);
        hub.notify(GraphEvent::NodeAdded {
            app: "app".into(),
            node_id: "n1".into(),
            state: NodeState::Waiting,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_not_blocking() {
        let hub = ObserverHub::new(1);
        let (_handle, _rx) = hub.subscribe();
        for _ in 0..5 {
            hub.notify(GraphEvent::NodeAdded {
                app: "app".into(),
                node_id: "n1".into(),
                state: NodeState::Waiting,
            });
        }
        // No panic, no deadlock: the buffer fills and further events are dropped.
    }
}
