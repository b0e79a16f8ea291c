//! Lifecycle event bus
//!
//! Sockets, tunnels, and proxy servers publish typed events on a shared
//! [`EventBus`]. Publishing never blocks and never fails: with no subscribers
//! the event is discarded, and a subscriber that falls behind loses its oldest
//! events rather than slowing the publisher.

mod types;

pub use types::{
    AdapterSocketEvent, Event, ProxyServerEvent, ProxySocketEvent, ServerId, SocketId, TunnelEvent,
    TunnelId,
};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast channel for [`Event`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: impl Into<Event>) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let _ = self.sender.send(event.into());
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Log every event at debug level until the bus is dropped
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(target: "fakeip_relay::event", "{}", event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagging, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
