//! # Engine events
//!
//! Everything the engine reports is a [`PubSubEvent`]. Consumers either
//! register callbacks for an [`EventKind`] with [`EventBus::on`] or take an
//! independent broadcast receiver with [`EventBus::subscribe`]. Any number of
//! handlers and receivers may be attached; each sees every event of its kind.
//!
//! Emission is fire-and-forget: handlers run synchronously on the emitting task
//! and must not block, and receivers that fall behind observe
//! `RecvError::Lagged` and skip the oldest events.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::PubSubError;

/// Event emitted by a [`PgPubSub`](crate::PgPubSub) engine
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A session was opened
    Connect,
    /// The engine was closed
    Close,
    /// The underlying session ended
    End,
    /// A connection-level failure or an exhausted reconnect
    Error(Arc<PubSubError>),
    /// The engine is now actively listening on a channel
    Listen(String),
    /// Channels that stopped being listened to
    Unlisten(Vec<String>),
    /// A session was re-opened after this many attempts
    Reconnect(u32),
    /// A message arrived on an actively listened channel
    Message {
        channel: String,
        /// Decoded payload; `None` when the notification carried none
        payload: Option<Value>,
    },
}

impl PubSubEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            PubSubEvent::Connect => EventKind::Connect,
            PubSubEvent::Close => EventKind::Close,
            PubSubEvent::End => EventKind::End,
            PubSubEvent::Error(_) => EventKind::Error,
            PubSubEvent::Listen(_) => EventKind::Listen,
            PubSubEvent::Unlisten(_) => EventKind::Unlisten,
            PubSubEvent::Reconnect(_) => EventKind::Reconnect,
            PubSubEvent::Message { .. } => EventKind::Message,
        }
    }
}

/// Closed set of event kinds handlers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Close,
    End,
    Error,
    Listen,
    Unlisten,
    Reconnect,
    Message,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Connect => "connect",
            EventKind::Close => "close",
            EventKind::End => "end",
            EventKind::Error => "error",
            EventKind::Listen => "listen",
            EventKind::Unlisten => "unlisten",
            EventKind::Reconnect => "reconnect",
            EventKind::Message => "message",
        };
        f.write_str(name)
    }
}

/// Callback registered for an event kind
pub type EventHandler = Arc<dyn Fn(&PubSubEvent) + Send + Sync>;

/// Identifies a registered handler for [`EventBus::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Fan-out of engine events to handlers and broadcast receivers
pub struct EventBus {
    tx: broadcast::Sender<PubSubEvent>,
    handlers: RwLock<Vec<(HandlerId, EventKind, EventHandler)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose broadcast buffer holds `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PubSubEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, kind, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Receiver observing every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PubSubEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to matching handlers and to all receivers
    pub fn emit(&self, event: PubSubEvent) {
        let kind = event.kind();

        // Snapshot so handlers may register or remove handlers themselves
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in matching {
            handler(&event);
        }

        let _ = self.tx.send(event);
    }
}
