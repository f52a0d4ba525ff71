//! # Exclusive channel lock
//!
//! A [`ChannelLock`] gives at most one connected session ownership of a channel
//! name. The server's session-scoped advisory lock is the arbiter: a grant is
//! only assumed after the server confirmed it, and the server drops it by itself
//! when the owning session dies, however ungracefully.
//!
//! Losing the race is the normal outcome for every standby and is reported as
//! `Ok(false)`, never as an error.
//!
//! A voluntary [`release`](ChannelLock::release) publishes the channel name on
//! [`RELEASE_CHANNEL`] so standbys can take over without waiting for their next
//! poll. A lock freed by a dead session sends no such notice.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::{LockKey, NotifyClient};
use crate::error::Result;
use crate::sql::{Statement, RELEASE_CHANNEL};

/// Local view of a channel lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    /// Never granted
    Unlocked = 0,
    /// Granted to this session
    Acquired = 1,
    /// Was granted, then released or lost with the session
    Released = 2,
}

impl From<u8> for LockState {
    fn from(value: u8) -> Self {
        match value {
            1 => LockState::Acquired,
            2 => LockState::Released,
            _ => LockState::Unlocked,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => write!(f, "unlocked"),
            LockState::Acquired => write!(f, "acquired"),
            LockState::Released => write!(f, "released"),
        }
    }
}

type ReleaseHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Distributed, session-scoped ownership of one channel
pub struct ChannelLock {
    channel: String,
    key: LockKey,
    client: Arc<dyn NotifyClient>,
    state: AtomicU8,
    initialized: AtomicBool,
    /// Serializes acquire and release round-trips for this channel
    op: Mutex<()>,
    release_handlers: RwLock<Vec<ReleaseHandler>>,
}

impl fmt::Debug for ChannelLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLock")
            .field("channel", &self.channel)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelLock {
    /// Create the lock for `channel` on the session held by `client`
    pub fn new(channel: impl Into<String>, client: Arc<dyn NotifyClient>) -> Self {
        let channel = channel.into();
        let key = LockKey::for_channel(&channel);
        Self {
            channel,
            key,
            client,
            state: AtomicU8::new(LockState::Unlocked as u8),
            initialized: AtomicBool::new(false),
            op: Mutex::new(()),
            release_handlers: RwLock::new(Vec::new()),
        }
    }

    /// Prepare bookkeeping; returns `true` only for the call that did the work
    pub fn init(&self) -> bool {
        let first = self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            debug!(channel = %self.channel, key = %self.key, "Channel lock initialized");
        }
        first
    }

    /// Channel this lock guards
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Server-side lock key
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Current local state
    pub fn state(&self) -> LockState {
        LockState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether this session holds the lock, as last confirmed by the server
    pub fn is_acquired(&self) -> bool {
        self.state() == LockState::Acquired
    }

    /// Try to take the lock without waiting
    ///
    /// A held lock answers locally so the server never stacks a second grant.
    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn acquire(&self) -> Result<bool> {
        let _guard = self.op.lock().await;

        if self.is_acquired() {
            return Ok(true);
        }

        let granted = self.client.try_advisory_lock(self.key).await?;
        if granted {
            self.state.store(LockState::Acquired as u8, Ordering::Release);
            info!(channel = %self.channel, "Channel lock acquired");
        } else {
            debug!(channel = %self.channel, "Channel lock held elsewhere");
        }

        Ok(granted)
    }

    /// Give up a held lock and announce it; a no-op when not held
    ///
    /// Returns whether a held lock was given up. When the session is already
    /// gone only the local state changes, the server freed the lock with it.
    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn release(&self) -> Result<bool> {
        let _guard = self.op.lock().await;

        if !self.is_acquired() {
            return Ok(false);
        }
        self.state.store(LockState::Released as u8, Ordering::Release);

        match self.client.advisory_unlock(self.key).await {
            Ok(_) => {}
            Err(e) if e.is_disconnect() => {
                debug!(channel = %self.channel, "Session gone, lock already freed");
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        let notice = Statement::Notify {
            channel: RELEASE_CHANNEL.to_string(),
            payload: self.channel.clone(),
        };
        if let Err(e) = self.client.execute(notice).await {
            warn!(channel = %self.channel, error = %e, "Failed to publish lock release notice");
        }

        info!(channel = %self.channel, "Channel lock released");
        Ok(true)
    }

    /// Record that the session holding the lock is gone
    ///
    /// Returns whether the lock was held.
    pub fn mark_lost(&self) -> bool {
        let lost = self
            .state
            .compare_exchange(
                LockState::Acquired as u8,
                LockState::Released as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if lost {
            warn!(channel = %self.channel, "Channel lock lost with its session");
        }
        lost
    }

    /// Register a callback for when another session gives the channel up
    pub fn on_release<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.release_handlers.write().push(Arc::new(handler));
    }

    /// Handle a release notice for this channel
    ///
    /// Handlers run only while this session is a standby. Returns whether they ran.
    pub fn handle_release_notice(&self) -> bool {
        if self.is_acquired() {
            return false;
        }

        let handlers: Vec<ReleaseHandler> = self.release_handlers.read().clone();
        debug!(
            channel = %self.channel,
            handlers = handlers.len(),
            "Channel released elsewhere"
        );
        for handler in &handlers {
            handler(&self.channel);
        }
        !handlers.is_empty()
    }
}
