//! # Publish/subscribe engine
//!
//! [`PgPubSub`] owns one notification session, the set of tracked channels and
//! the reconnect state machine. In single-listener mode it also runs the
//! per-channel election through [`ChannelLock`]s.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Idle ──connect──► Connected ──end──► Disconnected ──delay──► Reconnecting
//!                       ▲                    ▲                     │
//!                       └──── success ───────┼─────────────────────┤
//!                                            └────── failure ──────┤
//!                                                                  ▼
//!                                            Failed ◄── retries used up
//! ```
//!
//! Each reconnect attempt first increments the retry counter. Once it reaches
//! `retry_limit` the engine emits a single `Error` and closes for good. A
//! successful attempt re-listens every tracked channel, emits `Reconnect` with
//! the count and resets the counter.
//!
//! ## Failover
//!
//! When the session ends or fails, every held lock is released before the event
//! is surfaced. Standbys take the lock over on their next poll, or right away
//! when the previous owner released it voluntarily and announced it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::client::{ClientEvent, Notification, NotifyClient, PgNotifyClient};
use crate::codec;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::events::{EventBus, EventKind, HandlerId, PubSubEvent};
use crate::lock::ChannelLock;
use crate::sql::{validate_channel, Statement, RELEASE_CHANNEL};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected
    Idle = 0,
    /// Session is live
    Connected = 1,
    /// Session ended unexpectedly; a reconnect is pending
    Disconnected = 2,
    /// A reconnect attempt is in flight
    Reconnecting = 3,
    /// Reconnect attempts were used up
    Failed = 4,
    /// Closed by the caller
    Closed = 5,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubStats {
    pub state: ConnectionState,
    pub tracked_channels: usize,
    pub active_channels: usize,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub reconnects: u64,
    /// Consecutive failed reconnect attempts so far
    pub retry_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
enum Subscription {
    Listening,
    Exclusive(Arc<ChannelLock>),
}

impl Subscription {
    fn is_active(&self) -> bool {
        match self {
            Subscription::Listening => true,
            Subscription::Exclusive(lock) => lock.is_acquired(),
        }
    }
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    standby: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    reconnects: AtomicU64,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
}

struct Inner {
    config: PubSubConfig,
    client: Arc<dyn NotifyClient>,
    events: EventBus,
    channels: DashMap<String, Subscription>,
    state: AtomicU8,
    /// Reconnect hook; disarmed before any deliberate close
    armed: AtomicBool,
    closing: AtomicBool,
    retry: AtomicU32,
    policy: RetryPolicy,
    application_name: String,
    counters: Counters,
    tasks: Mutex<Tasks>,
}

/// Resilient publish/subscribe over PostgreSQL LISTEN/NOTIFY
///
/// Cloning yields another handle to the same engine.
///
/// # Examples
///
/// ```rust,no_run
/// use pg_pubsub::{EventKind, PgPubSub, PubSubConfig, PubSubEvent};
/// use serde_json::json;
///
/// # async fn run() -> pg_pubsub::Result<()> {
/// let config = PubSubConfig::new()
///     .with_database_url("postgres://localhost/app")
///     .with_single_listener(true);
/// let pubsub = PgPubSub::new(config)?;
///
/// pubsub.on(EventKind::Message, |event| {
///     if let PubSubEvent::Message { channel, payload } = event {
///         println!("{channel}: {payload:?}");
///     }
/// });
///
/// pubsub.connect().await?;
/// pubsub.listen("orders").await?;
/// pubsub.notify("orders", &json!({"id": 1})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgPubSub {
    inner: Arc<Inner>,
}

impl fmt::Debug for PgPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPubSub")
            .field("state", &self.inner.state())
            .field("single_listener", &self.inner.config.single_listener)
            .field("channels", &self.inner.channels.len())
            .field("application_name", &self.inner.application_name)
            .finish()
    }
}

impl PgPubSub {
    /// Create an engine talking to the configured PostgreSQL server
    pub fn new(config: PubSubConfig) -> Result<Self> {
        config.validate()?;
        let client = PgNotifyClient::from_url(&config.database_url, config.event_buffer_size)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Create an engine on a pre-built client
    ///
    /// The client must not be shared with another engine.
    pub fn with_client(config: PubSubConfig, client: Arc<dyn NotifyClient>) -> Result<Self> {
        config.validate()?;

        let inner = Inner {
            policy: RetryPolicy::from_config(&config),
            events: EventBus::new(config.event_buffer_size),
            application_name: Uuid::new_v4().to_string(),
            config,
            client,
            channels: DashMap::new(),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            armed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            retry: AtomicU32::new(0),
            counters: Counters::default(),
            tasks: Mutex::new(Tasks::default()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open the session and start dispatching its events
    ///
    /// Errors of this initial connect are returned as is; reconnects only
    /// happen for a session that was once established.
    #[instrument(skip(self), fields(application_name = %self.inner.application_name))]
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the engine; no reconnect fires afterwards
    ///
    /// Closing an already closed engine is a no-op.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        self.inner.armed.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.tasks.lock().reconnect.take() {
            handle.abort();
        }
        self.inner.close_session().await
    }

    /// Start listening on a channel
    ///
    /// In single-listener mode this only listens when the channel lock is won;
    /// otherwise the engine stays a standby and the call still succeeds.
    #[instrument(skip(self))]
    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.inner.listen(channel).await
    }

    /// Stop listening on a channel and give up its lock
    #[instrument(skip(self))]
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.inner.unlisten(channel).await
    }

    /// Stop listening on every channel
    #[instrument(skip(self))]
    pub async fn unlisten_all(&self) -> Result<()> {
        self.inner.unlisten_all().await
    }

    /// Publish a JSON payload on a channel
    ///
    /// Publishing never depends on holding the channel lock.
    #[instrument(skip(self, payload))]
    pub async fn notify<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) -> Result<()> {
        validate_channel(channel)?;

        let packed = codec::pack(Some(payload));
        if packed.len() > self.inner.config.max_payload_size {
            return Err(PubSubError::PayloadTooLarge {
                size: packed.len(),
                limit: self.inner.config.max_payload_size,
            });
        }

        self.inner
            .client
            .execute(Statement::Notify {
                channel: channel.to_string(),
                payload: packed,
            })
            .await?;

        debug!(channel, "Notification sent");
        Ok(())
    }

    /// Register a handler for one kind of event
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PubSubEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Remove a handler registered with [`on`](Self::on)
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PubSubEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Configuration the engine runs with
    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    /// Application name reported to the server
    pub fn application_name(&self) -> &str {
        &self.inner.application_name
    }

    /// Every tracked channel, sorted
    pub fn all_channels(&self) -> Vec<String> {
        self.inner.channels_where(|_| true)
    }

    /// Tracked channels this engine is actively listening on
    pub fn active_channels(&self) -> Vec<String> {
        self.inner.channels_where(Subscription::is_active)
    }

    /// Tracked channels this engine is a standby for
    pub fn inactive_channels(&self) -> Vec<String> {
        self.inner.channels_where(|subscription| !subscription.is_active())
    }

    /// Whether `channel` is actively listened to, or any channel when `None`
    pub fn is_active(&self, channel: Option<&str>) -> bool {
        match channel {
            Some(channel) => self
                .inner
                .channels
                .get(channel)
                .map(|subscription| subscription.is_active())
                .unwrap_or(false),
            None => self
                .inner
                .channels
                .iter()
                .any(|entry| entry.value().is_active()),
        }
    }

    /// Snapshot of the engine counters
    pub fn stats(&self) -> PubSubStats {
        let counters = &self.inner.counters;
        PubSubStats {
            state: self.inner.state(),
            tracked_channels: self.inner.channels.len(),
            active_channels: self.active_channels().len(),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            messages_dropped: counters.messages_dropped.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            retry_count: self.inner.retry.load(Ordering::SeqCst),
            last_message_at: *counters.last_message_at.lock(),
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn channels_where(&self, predicate: impl Fn(&Subscription) -> bool) -> Vec<String> {
        let mut channels: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        channels.sort();
        channels
    }

    fn exclusive_locks(&self) -> Vec<Arc<ChannelLock>> {
        self.channels
            .iter()
            .filter_map(|entry| match entry.value() {
                Subscription::Exclusive(lock) => Some(Arc::clone(lock)),
                Subscription::Listening => None,
            })
            .collect()
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        self.ensure_pump();
        self.client.connect().await?;

        self.closing.store(false, Ordering::SeqCst);
        self.retry.store(0, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.prepare_session().await;

        if self.config.single_listener {
            self.ensure_standby_poll();
        }

        info!(application_name = %self.application_name, "Connected");
        self.events.emit(PubSubEvent::Connect);
        Ok(())
    }

    /// Best-effort setup run on every fresh session
    async fn prepare_session(&self) {
        let label = Statement::SetApplicationName(self.application_name.clone());
        if let Err(e) = self.client.execute(label).await {
            debug!(error = %e, "Could not set application name");
        }

        if self.config.single_listener {
            let notices = Statement::Listen(RELEASE_CHANNEL.to_string());
            if let Err(e) = self.client.execute(notices).await {
                warn!(error = %e, "Could not listen for lock release notices");
            }
        }
    }

    async fn close_session(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("Already closed");
            return Ok(());
        }

        if self.state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Closed);
        }
        if let Some(handle) = self.tasks.lock().standby.take() {
            handle.abort();
        }

        self.release_locks().await;
        let result = self.client.end().await;

        info!("Closed");
        self.events.emit(PubSubEvent::Close);
        result
    }

    async fn listen(self: &Arc<Self>, channel: &str) -> Result<()> {
        validate_channel(channel)?;

        if !self.config.single_listener {
            self.client
                .execute(Statement::Listen(channel.to_string()))
                .await?;
            self.channels
                .insert(channel.to_string(), Subscription::Listening);

            info!(channel, "Listening");
            self.events.emit(PubSubEvent::Listen(channel.to_string()));
            return Ok(());
        }

        let lock = self.lock_for(channel);
        self.listen_exclusive(channel, &lock).await
    }

    /// Listen again on a channel that is still tracked
    ///
    /// Used by reconnects and takeovers, which must never revive a channel the
    /// caller has unlistened in the meantime.
    async fn relisten(&self, channel: &str) -> Result<()> {
        let subscription = self.channels.get(channel).map(|entry| entry.value().clone());
        match subscription {
            Some(Subscription::Exclusive(lock)) => self.listen_exclusive(channel, &lock).await,
            Some(Subscription::Listening) => {
                self.client
                    .execute(Statement::Listen(channel.to_string()))
                    .await?;
                if !self.channels.contains_key(channel) {
                    self.drop_stray_listen(channel).await;
                    return Ok(());
                }

                info!(channel, "Listening");
                self.events.emit(PubSubEvent::Listen(channel.to_string()));
                Ok(())
            }
            None => {
                debug!(channel, "Channel no longer tracked, not listening again");
                Ok(())
            }
        }
    }

    async fn listen_exclusive(&self, channel: &str, lock: &Arc<ChannelLock>) -> Result<()> {
        if !lock.acquire().await? {
            debug!(channel, "Standing by for channel");
            return Ok(());
        }

        if !self.tracks(channel, lock) {
            debug!(channel, "Channel unlistened while acquiring, giving the lock back");
            lock.release().await?;
            return Ok(());
        }

        if let Err(e) = self
            .client
            .execute(Statement::Listen(channel.to_string()))
            .await
        {
            // Never keep a channel nobody in the fleet listens on
            if let Err(release_error) = lock.release().await {
                warn!(channel, error = %release_error, "Failed to release lock after LISTEN failure");
            }
            return Err(e);
        }

        if !self.tracks(channel, lock) {
            lock.release().await?;
            if !self.channels.contains_key(channel) {
                self.drop_stray_listen(channel).await;
            }
            return Ok(());
        }

        info!(channel, "Listening as the exclusive listener");
        self.events.emit(PubSubEvent::Listen(channel.to_string()));
        Ok(())
    }

    /// Whether `lock` is still the tracked lock for `channel`
    fn tracks(&self, channel: &str, lock: &Arc<ChannelLock>) -> bool {
        self.channels.get(channel).is_some_and(|entry| {
            matches!(entry.value(), Subscription::Exclusive(current) if Arc::ptr_eq(current, lock))
        })
    }

    /// Undo a LISTEN that raced with an unlisten of the same channel
    async fn drop_stray_listen(&self, channel: &str) {
        debug!(channel, "Channel unlistened while listening, undoing LISTEN");
        if let Err(e) = self
            .client
            .execute(Statement::Unlisten(channel.to_string()))
            .await
        {
            debug!(channel, error = %e, "Failed to undo LISTEN");
        }
    }

    /// Lock for a channel, created and wired on first use
    fn lock_for(self: &Arc<Self>, channel: &str) -> Arc<ChannelLock> {
        let lock = {
            let mut entry = self
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| {
                    Subscription::Exclusive(Arc::new(ChannelLock::new(
                        channel,
                        Arc::clone(&self.client),
                    )))
                });

            match entry.value() {
                Subscription::Exclusive(lock) => Arc::clone(lock),
                Subscription::Listening => {
                    let lock = Arc::new(ChannelLock::new(channel, Arc::clone(&self.client)));
                    *entry = Subscription::Exclusive(Arc::clone(&lock));
                    lock
                }
            }
        };

        if lock.init() {
            let weak = Arc::downgrade(self);
            lock.on_release(move |channel| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let channel = channel.to_string();
                tokio::spawn(async move {
                    if let Err(e) = inner.relisten(&channel).await {
                        warn!(channel = %channel, error = %e, "Takeover attempt failed");
                    }
                });
            });
        }

        lock
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        self.client
            .execute(Statement::Unlisten(channel.to_string()))
            .await?;

        if let Some((_, Subscription::Exclusive(lock))) = self.channels.remove(channel) {
            lock.release().await?;
        }

        info!(channel, "Stopped listening");
        self.events
            .emit(PubSubEvent::Unlisten(vec![channel.to_string()]));
        Ok(())
    }

    async fn unlisten_all(&self) -> Result<()> {
        self.client.execute(Statement::UnlistenAll).await?;

        let channels = self.channels_where(|_| true);
        let mut locks = Vec::new();
        for channel in &channels {
            if let Some((_, Subscription::Exclusive(lock))) = self.channels.remove(channel) {
                locks.push(lock);
            }
        }

        for lock in locks {
            if let Err(e) = lock.release().await {
                warn!(channel = %lock.channel(), error = %e, "Failed to release channel lock");
            }
        }

        info!(count = channels.len(), "Stopped listening on all channels");
        self.events.emit(PubSubEvent::Unlisten(channels));
        Ok(())
    }

    /// Give up every held lock; failures fall back to local bookkeeping
    async fn release_locks(&self) {
        for lock in self.exclusive_locks() {
            if let Err(e) = lock.release().await {
                warn!(channel = %lock.channel(), error = %e, "Failed to release channel lock");
                lock.mark_lost();
            }
        }
    }

    fn ensure_pump(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let events = self.client.subscribe();
        tasks.pump = Some(tokio::spawn(pump(Arc::downgrade(self), events)));
    }

    fn ensure_standby_poll(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks
            .standby
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        tasks.standby = Some(tokio::spawn(standby_poll(
            Arc::downgrade(self),
            self.config.acquire_interval(),
        )));
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        tasks.reconnect = Some(tokio::spawn(reconnect(Arc::downgrade(self))));
    }

    fn dispatch(&self, notification: Notification) {
        let Notification {
            channel,
            payload,
            process_id,
        } = notification;

        if channel == RELEASE_CHANNEL {
            self.handle_release_notice(&payload, process_id);
            return;
        }

        if self.config.filtered && self.client.backend_pid() == Some(process_id) {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, "Dropped notification sent by this session");
            return;
        }

        let subscription = self.channels.get(&channel).map(|entry| entry.value().clone());
        let deliver = match subscription {
            Some(subscription) => subscription.is_active(),
            None => !self.config.single_listener,
        };
        if !deliver {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, "Dropped notification for a channel not owned here");
            return;
        }

        let payload = if payload.is_empty() {
            None
        } else {
            Some(codec::unpack(Some(&payload)))
        };

        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        *self.counters.last_message_at.lock() = Some(Utc::now());

        self.events.emit(PubSubEvent::Message { channel, payload });
    }

    fn handle_release_notice(&self, channel: &str, process_id: i32) {
        if !self.config.single_listener
            || self.state() != ConnectionState::Connected
            || self.client.backend_pid() == Some(process_id)
        {
            return;
        }

        let lock = match self.channels.get(channel).map(|entry| entry.value().clone()) {
            Some(Subscription::Exclusive(lock)) => lock,
            _ => return,
        };
        lock.handle_release_notice();
    }

    /// Whether an event from `backend_pid` belongs to a session already replaced
    fn is_stale(&self, backend_pid: i32) -> bool {
        self.client
            .backend_pid()
            .is_some_and(|current| current != backend_pid)
    }

    async fn on_error(&self, backend_pid: i32, error: Arc<PubSubError>) {
        if self.is_stale(backend_pid) {
            debug!(backend_pid, error = %error, "Ignoring error from a previous session");
            return;
        }

        error!(backend_pid, error = %error, "Session error");
        if self.config.single_listener {
            self.release_locks().await;
        }
        self.events.emit(PubSubEvent::Error(error));
    }

    fn on_end(self: &Arc<Self>, backend_pid: i32) {
        if self.is_stale(backend_pid) {
            debug!(backend_pid, "Ignoring end of a previous session");
            return;
        }

        // Locks held by a live session are still ours
        if self.config.single_listener && !self.client.is_connected() {
            for lock in self.exclusive_locks() {
                lock.mark_lost();
            }
        }

        let reconnect =
            self.armed.load(Ordering::SeqCst) && self.state() == ConnectionState::Connected;
        if reconnect {
            warn!("Session ended unexpectedly, scheduling reconnect");
            self.set_state(ConnectionState::Disconnected);
        }

        self.events.emit(PubSubEvent::End);

        if reconnect {
            self.schedule_reconnect();
        }
    }

    /// Reopen a session and restore every tracked channel on it
    async fn reopen(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Reconnecting);
        self.client.connect().await?;
        self.set_state(ConnectionState::Connected);
        self.prepare_session().await;
        self.events.emit(PubSubEvent::Connect);

        let channels = self.channels_where(|_| true);
        let relistened = join_all(channels.iter().map(|channel| self.relisten(channel))).await;
        for (channel, result) in channels.iter().zip(relistened) {
            if let Err(e) = result {
                warn!(channel = %channel, error = %e, "Failed to re-listen after reconnect");
            }
        }

        Ok(())
    }

    /// Finish a reconnect unless the new session already ended again
    ///
    /// Checked under the task lock so an `End` handled concurrently either sees
    /// this loop still running or schedules a fresh one.
    fn finish_reconnect(&self) -> bool {
        let mut tasks = self.tasks.lock();
        if self.state() == ConnectionState::Connected && self.client.is_connected() {
            tasks.reconnect = None;
            return true;
        }
        self.set_state(ConnectionState::Disconnected);
        false
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [
            tasks.pump.take(),
            tasks.reconnect.take(),
            tasks.standby.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Route client events into the engine
async fn pump(inner: Weak<Inner>, mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event pump lagged, client events were lost");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            ClientEvent::Notification(notification) => inner.dispatch(notification),
            ClientEvent::Error { backend_pid, error } => inner.on_error(backend_pid, error).await,
            ClientEvent::End { backend_pid } => inner.on_end(backend_pid),
        }
    }

    debug!("Event pump stopped");
}

/// Reconnect loop; runs until a session is back or attempts are used up
async fn reconnect(inner: Weak<Inner>) {
    loop {
        let delay = match inner.upgrade() {
            Some(inner) => inner.policy.delay_for(inner.retry.load(Ordering::SeqCst)),
            None => return,
        };
        tokio::time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.armed.load(Ordering::SeqCst) {
            return;
        }

        let retry = inner.retry.fetch_add(1, Ordering::SeqCst) + 1;
        if retry >= inner.config.retry_limit {
            error!(retries = retry, "Reconnect attempts exhausted, closing");
            inner.armed.store(false, Ordering::SeqCst);
            // Detach our own handle; a concurrent close() must not abort the shutdown below
            drop(inner.tasks.lock().reconnect.take());
            inner.set_state(ConnectionState::Failed);
            inner
                .events
                .emit(PubSubEvent::Error(Arc::new(PubSubError::ReconnectExhausted {
                    retries: retry,
                })));
            if let Err(e) = inner.close_session().await {
                debug!(error = %e, "Close after exhausted reconnect failed");
            }
            return;
        }

        info!(retry, "Reconnecting");
        match inner.reopen().await {
            Ok(()) if inner.finish_reconnect() => {
                inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(retry, "Reconnected");
                inner.events.emit(PubSubEvent::Reconnect(retry));
                inner.retry.store(0, Ordering::SeqCst);
                return;
            }
            Ok(()) => warn!(retry, "Session ended again while restoring channels"),
            Err(e) => {
                warn!(retry, error = %e, "Reconnect attempt failed");
                inner.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

/// Periodically retry the channels this engine is a standby for
///
/// A lock freed by a dead session is announced by nobody, so polling is what
/// guarantees takeover.
async fn standby_poll(inner: Weak<Inner>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.state() != ConnectionState::Connected {
            continue;
        }

        let standby: Vec<String> = inner
            .exclusive_locks()
            .into_iter()
            .filter(|lock| !lock.is_acquired())
            .map(|lock| lock.channel().to_string())
            .collect();

        for channel in standby {
            if let Err(e) = inner.relisten(&channel).await {
                debug!(channel = %channel, error = %e, "Standby acquire attempt failed");
            }
        }
    }
}
