// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal typed event bus.
//!
//! Every lifecycle notification (session state changes, credential
//! challenges, deliveries, dead letters, breaker transitions) is published
//! here. The reconnection scheduler, the health monitor and any transport
//! layer observe the same stream by subscribing.

pub mod events;

pub use events::{DestroyCause, WamuxEvent};

use tokio::sync::broadcast;

/// Default number of events buffered per subscriber before it lags.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast fan-out of [`WamuxEvent`]s.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WamuxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event, returning how many subscribers received it.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: WamuxEvent) -> usize {
        tracing::trace!(kind = event.kind(), "publishing event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WamuxEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
