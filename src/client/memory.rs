//! In-process LISTEN/NOTIFY server and client
//!
//! [`InMemoryServer`] models the parts of a PostgreSQL server the engine relies
//! on: sessions with backend pids, per-session LISTEN sets, NOTIFY fan-out, and
//! reentrant session-scoped advisory locks that vanish with their session.
//! Faults can be injected with [`InMemoryServer::kill_session`] and
//! [`InMemoryServer::set_available`].
//!
//! Several [`InMemoryClient`]s attached to one server behave like separate
//! processes connected to the same database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ClientEvent, LockKey, Notification, NotifyClient};
use crate::error::{PubSubError, Result};
use crate::sql::Statement;

const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

struct SessionState {
    events: broadcast::Sender<ClientEvent>,
    listening: HashSet<String>,
    application_name: Option<String>,
}

struct LockHold {
    pid: i32,
    count: u32,
}

#[derive(Default)]
struct ServerState {
    sessions: HashMap<i32, SessionState>,
    locks: HashMap<LockKey, LockHold>,
    next_pid: i32,
    unavailable: bool,
}

/// Shared in-process server
#[derive(Default)]
pub struct InMemoryServer {
    state: Mutex<ServerState>,
    connect_attempts: AtomicUsize,
}

impl std::fmt::Debug for InMemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryServer")
            .field("sessions", &state.sessions.len())
            .field("locks", &state.locks.len())
            .field("available", &!state.unavailable)
            .finish()
    }
}

impl InMemoryServer {
    /// Create a new server
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a client attached to this server
    pub fn client(self: &Arc<Self>) -> Arc<InMemoryClient> {
        Arc::new(InMemoryClient::new(Arc::clone(self)))
    }

    /// Refuse (or accept again) new sessions
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Number of session open attempts, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Terminate a session the way a crashed backend or a dropped socket would
    ///
    /// Its advisory locks are released and its client observes an `End`.
    pub fn kill_session(&self, pid: i32) -> bool {
        let session = self.remove_session(pid);
        match session {
            Some(session) => {
                debug!(pid, "Killing in-memory session");
                let _ = session.events.send(ClientEvent::End { backend_pid: pid });
                true
            }
            None => false,
        }
    }

    /// Inject a session error followed by the session's end
    pub fn fail_session(&self, pid: i32, message: &str) -> bool {
        let session = self.remove_session(pid);
        match session {
            Some(session) => {
                let _ = session.events.send(ClientEvent::Error {
                    backend_pid: pid,
                    error: Arc::new(PubSubError::connection(message)),
                });
                let _ = session.events.send(ClientEvent::End { backend_pid: pid });
                true
            }
            None => false,
        }
    }

    /// Pid of the session holding the advisory lock for `key`
    pub fn lock_holder(&self, key: LockKey) -> Option<i32> {
        self.state.lock().locks.get(&key).map(|hold| hold.pid)
    }

    /// Pids of the sessions listening on `channel`
    pub fn listeners(&self, channel: &str) -> Vec<i32> {
        let state = self.state.lock();
        let mut pids: Vec<i32> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.listening.contains(channel))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Application name set by a session
    pub fn application_name(&self, pid: i32) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(&pid)
            .and_then(|session| session.application_name.clone())
    }

    fn open_session(&self, events: broadcast::Sender<ClientEvent>) -> Result<i32> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.unavailable {
            return Err(PubSubError::connection("in-memory server is not accepting connections"));
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        state.sessions.insert(
            pid,
            SessionState {
                events,
                listening: HashSet::new(),
                application_name: None,
            },
        );
        Ok(pid)
    }

    fn remove_session(&self, pid: i32) -> Option<SessionState> {
        let mut state = self.state.lock();
        let session = state.sessions.remove(&pid)?;
        state.locks.retain(|_, hold| hold.pid != pid);
        Some(session)
    }

    fn execute(&self, pid: i32, statement: Statement) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&pid) {
            return Err(PubSubError::NotConnected);
        }

        match statement {
            Statement::Listen(channel) => {
                if let Some(session) = state.sessions.get_mut(&pid) {
                    session.listening.insert(channel);
                }
            }
            Statement::Unlisten(channel) => {
                if let Some(session) = state.sessions.get_mut(&pid) {
                    session.listening.remove(&channel);
                }
            }
            Statement::UnlistenAll => {
                if let Some(session) = state.sessions.get_mut(&pid) {
                    session.listening.clear();
                }
            }
            Statement::SetApplicationName(name) => {
                if let Some(session) = state.sessions.get_mut(&pid) {
                    session.application_name = Some(name);
                }
            }
            Statement::Notify { channel, payload } => {
                for session in state.sessions.values() {
                    if session.listening.contains(&channel) {
                        let _ = session.events.send(ClientEvent::Notification(Notification {
                            channel: channel.clone(),
                            payload: payload.clone(),
                            process_id: pid,
                        }));
                    }
                }
            }
        }

        Ok(())
    }

    fn try_lock(&self, pid: i32, key: LockKey) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&pid) {
            return Err(PubSubError::NotConnected);
        }

        match state.locks.entry(key) {
            Entry::Occupied(mut hold) => {
                if hold.get().pid != pid {
                    return Ok(false);
                }
                hold.get_mut().count += 1;
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(LockHold { pid, count: 1 });
                Ok(true)
            }
        }
    }

    fn unlock(&self, pid: i32, key: LockKey) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&pid) {
            return Err(PubSubError::NotConnected);
        }

        let Some(hold) = state.locks.get_mut(&key) else {
            return Ok(false);
        };
        if hold.pid != pid {
            return Ok(false);
        }

        hold.count -= 1;
        if hold.count == 0 {
            state.locks.remove(&key);
        }
        Ok(true)
    }

    fn has_session(&self, pid: i32) -> bool {
        self.state.lock().sessions.contains_key(&pid)
    }
}

/// [`NotifyClient`] attached to an [`InMemoryServer`]
pub struct InMemoryClient {
    server: Arc<InMemoryServer>,
    events: broadcast::Sender<ClientEvent>,
    pid: Mutex<Option<i32>>,
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("pid", &*self.pid.lock())
            .finish()
    }
}

impl InMemoryClient {
    /// Create a client for `server`
    pub fn new(server: Arc<InMemoryServer>) -> Self {
        Self::with_event_buffer_size(server, DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Create a client with a custom event buffer capacity
    pub fn with_event_buffer_size(server: Arc<InMemoryServer>, event_buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer_size.max(1));
        Self {
            server,
            events,
            pid: Mutex::new(None),
        }
    }

    fn live_pid(&self) -> Result<i32> {
        let pid = (*self.pid.lock()).ok_or(PubSubError::NotConnected)?;
        if self.server.has_session(pid) {
            Ok(pid)
        } else {
            Err(PubSubError::NotConnected)
        }
    }
}

#[async_trait]
impl NotifyClient for InMemoryClient {
    async fn connect(&self) -> Result<()> {
        if self.live_pid().is_ok() {
            return Ok(());
        }

        let pid = self.server.open_session(self.events.clone())?;
        *self.pid.lock() = Some(pid);
        debug!(pid, "In-memory session opened");
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        let Some(pid) = self.pid.lock().take() else {
            return Ok(());
        };

        if self.server.remove_session(pid).is_some() {
            debug!(pid, "In-memory session ended");
            let _ = self.events.send(ClientEvent::End { backend_pid: pid });
        }
        Ok(())
    }

    async fn execute(&self, statement: Statement) -> Result<()> {
        let pid = self.live_pid()?;
        self.server.execute(pid, statement)
    }

    async fn try_advisory_lock(&self, key: LockKey) -> Result<bool> {
        let pid = self.live_pid()?;
        self.server.try_lock(pid, key)
    }

    async fn advisory_unlock(&self, key: LockKey) -> Result<bool> {
        let pid = self.live_pid()?;
        self.server.unlock(pid, key)
    }

    fn backend_pid(&self) -> Option<i32> {
        self.live_pid().ok()
    }

    fn is_connected(&self) -> bool {
        self.live_pid().is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}
