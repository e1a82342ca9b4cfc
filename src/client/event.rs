//! Typed notifications emitted by sessions and clients.
//!
//! Push messages are never interleaved into the request/reply correlation
//! sequence; they arrive here, in wire order.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A notification from a session or client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A pub/sub message on a directly subscribed channel.
    Message {
        /// Channel the message was published to.
        channel: Bytes,
        /// Message payload.
        payload: Bytes,
    },

    /// A pub/sub message that matched a pattern subscription.
    PatternMessage {
        /// The pattern that matched.
        pattern: Bytes,
        /// Channel the message was published to.
        channel: Bytes,
        /// Message payload.
        payload: Bytes,
    },

    /// Confirmation of a channel subscription.
    Subscribe {
        /// The channel subscribed to.
        channel: Bytes,
        /// Total subscriptions on the connection after this one.
        subscriptions: i64,
    },

    /// Confirmation of a channel unsubscription. Synthesized locally when
    /// a connection with active subscriptions disappears.
    Unsubscribe {
        /// The channel unsubscribed from.
        channel: Bytes,
        /// Total subscriptions remaining on the connection.
        subscriptions: i64,
    },

    /// Confirmation of a pattern subscription.
    PatternSubscribe {
        /// The pattern subscribed to.
        pattern: Bytes,
        /// Total subscriptions on the connection after this one.
        subscriptions: i64,
    },

    /// Confirmation of a pattern unsubscription. Synthesized locally when
    /// a connection with active subscriptions disappears.
    PatternUnsubscribe {
        /// The pattern unsubscribed from.
        pattern: Bytes,
        /// Total subscriptions remaining on the connection.
        subscriptions: i64,
    },

    /// A fatal stream error. Followed by `Closed`.
    Error(String),

    /// The session (or client) reached its terminal state. Emitted exactly
    /// once.
    Closed {
        /// True when the peer closed the stream, false for local closure.
        by_peer: bool,
    },
}

/// Fan-out hub delivering events to any number of registered receivers.
///
/// Delivery order within one receiver always matches emission order;
/// receivers whose channel has been dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventHub {
    senders: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver.
    pub fn register(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver an event to every live receiver.
    pub fn emit(&self, event: Event) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every registered receiver.
    pub fn detach_all(&self) {
        self.senders.lock().clear();
    }
}
