// ===============================
// src/stream.rs
// ===============================
//
// Event stream transport: broadcast fan-out to every subscribed client.
// No backpressure handling beyond the channel's lag semantics — a client
// that falls behind is dropped by its reader. The only buffering is the
// replay-on-join bid list assembled by the store.
//

use tokio::sync::broadcast;

use crate::domain::AuctionEvent;
use crate::metrics::EVENTS_PUBLISHED;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuctionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan out to all live handles. Returns receiver count; zero when
    /// nobody is listening (the auction keeps running headless).
    pub fn publish(&self, ev: AuctionEvent) -> usize {
        EVENTS_PUBLISHED.with_label_values(&[ev.kind()]).inc();
        self.tx.send(ev).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuctionEvent> {
        self.tx.subscribe()
    }
}

/// What a joining client gets: already-known bids in creation order,
/// then the live feed.
pub struct Subscription {
    pub replay: Vec<AuctionEvent>,
    pub rx: broadcast::Receiver<AuctionEvent>,
}
