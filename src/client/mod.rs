//! # Underlying database client
//!
//! [`NotifyClient`] is the seam between the engine and whatever carries the
//! session: [`PgNotifyClient`] talks to PostgreSQL through sqlx, and
//! [`InMemoryClient`] runs against an in-process [`InMemoryServer`].
//!
//! A client owns at most one live session at a time. Lifecycle and inbound
//! notifications are published as [`ClientEvent`]s on a broadcast channel that
//! survives reconnects, so a subscriber taken once keeps receiving events from
//! every later session.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{PubSubError, Result};
use crate::sql::Statement;

pub use memory::{InMemoryClient, InMemoryServer};
pub use postgres::PgNotifyClient;

/// Advisory lock key in the server's `bigint` key space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(i64);

impl LockKey {
    /// Wrap a raw key
    pub fn new(key: i64) -> Self {
        Self(key)
    }

    /// Key shared by every process locking `channel`
    pub fn for_channel(channel: &str) -> Self {
        Self(crate::codec::channel_key(channel))
    }

    /// Raw key as bound into the lock functions
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A notification delivered by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    /// Raw payload text; empty when NOTIFY carried none
    pub payload: String,
    /// Backend pid of the publishing session
    pub process_id: i32,
}

/// Events published by a client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Inbound notification
    Notification(Notification),
    /// Session failed; an `End` follows when the session is gone
    Error {
        /// Backend pid of the failed session
        backend_pid: i32,
        error: Arc<PubSubError>,
    },
    /// Session ended, deliberately or not
    End {
        /// Backend pid of the ended session
        backend_pid: i32,
    },
}

/// Session-holding client used by the engine
#[async_trait]
pub trait NotifyClient: Send + Sync + fmt::Debug {
    /// Open a new session; a no-op while one is live
    async fn connect(&self) -> Result<()>;

    /// End the live session; a no-op without one
    async fn end(&self) -> Result<()>;

    /// Execute a statement on the live session
    async fn execute(&self, statement: Statement) -> Result<()>;

    /// Try to take a session-scoped advisory lock without waiting
    async fn try_advisory_lock(&self, key: LockKey) -> Result<bool>;

    /// Release one hold of a session-scoped advisory lock
    async fn advisory_unlock(&self, key: LockKey) -> Result<bool>;

    /// Backend pid of the live session
    fn backend_pid(&self) -> Option<i32>;

    /// Whether a session is live
    fn is_connected(&self) -> bool;

    /// Receiver for events of this and all later sessions
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}
