// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! durably-bus: the in-process event bus (spec §4.C) and the per-run
//! subscription stream built on top of it (spec §4.H).

mod subscription;

pub use subscription::RunSubscription;

use durably_core::{Event, EventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast channel. A subscriber slower than this many
/// events behind the publisher starts missing events (`RecvError::Lagged`)
/// rather than blocking the publisher — the async analogue of spec §4.C's
/// "a subscriber throwing must not abort the publish".
const CHANNEL_CAPACITY: usize = 1024;

/// Typed publish/subscribe bus for Durably lifecycle events.
///
/// Cloning an `EventBus` is cheap and shares the same underlying channel
/// and sequence counter (it is a thin `Arc`-like handle, mirroring
/// `tokio::sync::broadcast::Sender`'s own `Clone` semantics).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: std::sync::Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            sequence: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event, assigning it the next monotonic sequence number
    /// (spec §4.C). Returns the number of live subscribers that received
    /// it; zero is not an error (nobody is listening yet).
    pub fn publish(&self, kind: EventKind) -> Event {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = Event { sequence, kind };
        trace!(sequence, name = event.kind.name(), "publishing event");
        // `send` only fails when there are zero receivers, which is a
        // normal, non-error condition for this bus (nobody subscribed yet).
        let _ = self.sender.send(event.clone());
        event
    }

    /// Subscribe to all events published from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
