//! PostgreSQL client built on `sqlx::PgListener`
//!
//! Each session is one dedicated connection driven by a background task. The
//! task multiplexes inbound notifications and statement requests with
//! `tokio::select!`, so statements reach the wire in submission order and
//! notifications are read while the session is otherwise idle.
//!
//! Connection loss is reported as [`ClientEvent::End`] and the task exits; the
//! listener's own reconnect is never relied on, because a new connection is a
//! new session and silently loses every advisory lock the old one held.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use super::{ClientEvent, LockKey, Notification, NotifyClient};
use crate::error::{PubSubError, Result};
use crate::sql::Statement;

/// Queued statement requests per session
const SESSION_COMMAND_BUFFER_SIZE: usize = 64;

enum SessionCommand {
    Execute {
        statement: Statement,
        reply: oneshot::Sender<Result<()>>,
    },
    TryLock {
        key: LockKey,
        reply: oneshot::Sender<Result<bool>>,
    },
    Unlock {
        key: LockKey,
        reply: oneshot::Sender<Result<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Session {
    commands: mpsc::Sender<SessionCommand>,
    backend_pid: i32,
}

/// [`NotifyClient`] backed by a PostgreSQL server
pub struct PgNotifyClient {
    connect_options: PgConnectOptions,
    events: broadcast::Sender<ClientEvent>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for PgNotifyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyClient")
            .field("host", &self.connect_options.get_host())
            .field("database", &self.connect_options.get_database())
            .field("backend_pid", &self.backend_pid())
            .finish()
    }
}

impl PgNotifyClient {
    /// Create a client for the given connection options
    pub fn new(connect_options: PgConnectOptions, event_buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer_size.max(1));
        Self {
            connect_options,
            events,
            session: Mutex::new(None),
        }
    }

    /// Create a client from a connection URL
    pub fn from_url(database_url: &str, event_buffer_size: usize) -> Result<Self> {
        let connect_options = database_url.parse::<PgConnectOptions>()?;
        Ok(Self::new(connect_options, event_buffer_size))
    }

    fn commands(&self) -> Result<mpsc::Sender<SessionCommand>> {
        self.session
            .lock()
            .as_ref()
            .filter(|session| !session.commands.is_closed())
            .map(|session| session.commands.clone())
            .ok_or(PubSubError::NotConnected)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let commands = self.commands()?;
        let (reply, response) = oneshot::channel();

        commands
            .send(command(reply))
            .await
            .map_err(|_| PubSubError::NotConnected)?;

        response.await.map_err(|_| PubSubError::NotConnected)?
    }
}

#[async_trait]
impl NotifyClient for PgNotifyClient {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected to database");
            return Ok(());
        }

        info!("Opening notification session");

        // One connection per session; the pool never replaces it behind our back
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(self.connect_options.clone())
            .await?;

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        };

        let backend_pid = match sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut listener)
            .await
        {
            Ok(pid) => pid,
            Err(e) => {
                drop(listener);
                pool.close().await;
                return Err(e.into());
            }
        };

        let (commands, command_rx) = mpsc::channel(SESSION_COMMAND_BUFFER_SIZE);
        tokio::spawn(session_task(
            pool,
            listener,
            command_rx,
            self.events.clone(),
            backend_pid,
        ));

        *self.session.lock() = Some(Session {
            commands,
            backend_pid,
        });

        info!(backend_pid, "Notification session opened");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn end(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            debug!("No session to end");
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        if session
            .commands
            .send(SessionCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }

        Ok(())
    }

    async fn execute(&self, statement: Statement) -> Result<()> {
        self.request(|reply| SessionCommand::Execute { statement, reply })
            .await
    }

    async fn try_advisory_lock(&self, key: LockKey) -> Result<bool> {
        self.request(|reply| SessionCommand::TryLock { key, reply })
            .await
    }

    async fn advisory_unlock(&self, key: LockKey) -> Result<bool> {
        self.request(|reply| SessionCommand::Unlock { key, reply })
            .await
    }

    fn backend_pid(&self) -> Option<i32> {
        self.session
            .lock()
            .as_ref()
            .filter(|session| !session.commands.is_closed())
            .map(|session| session.backend_pid)
    }

    fn is_connected(&self) -> bool {
        self.commands().is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Background task owning one session's connection
async fn session_task(
    pool: PgPool,
    mut listener: PgListener,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<ClientEvent>,
    backend_pid: i32,
) {
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            notification = listener.try_recv() => {
                match notification {
                    Ok(Some(notification)) => {
                        debug!(
                            channel = %notification.channel(),
                            "Received notification"
                        );
                        let _ = events.send(ClientEvent::Notification(Notification {
                            channel: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                            process_id: notification.process_id() as i32,
                        }));
                    }
                    Ok(None) => {
                        warn!(backend_pid, "Notification session lost its connection");
                        break;
                    }
                    Err(e) => {
                        error!(backend_pid, error = %e, "Notification session failed");
                        let _ = events.send(ClientEvent::Error {
                            backend_pid,
                            error: Arc::new(e.into()),
                        });
                        break;
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Execute { statement, reply }) => {
                        let sql = statement.to_sql();
                        let result = (&mut listener)
                            .execute(sql.as_str())
                            .await
                            .map(|_| ())
                            .map_err(PubSubError::from);
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::TryLock { key, reply }) => {
                        let result = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                            .bind(key.as_i64())
                            .fetch_one(&mut listener)
                            .await
                            .map_err(PubSubError::from);
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Unlock { key, reply }) => {
                        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                            .bind(key.as_i64())
                            .fetch_one(&mut listener)
                            .await
                            .map_err(PubSubError::from);
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Shutdown { reply }) => {
                        // Pooled connections outlive the listener; leave nothing held
                        if let Err(e) = (&mut listener)
                            .execute("SELECT pg_advisory_unlock_all(); UNLISTEN *")
                            .await
                        {
                            debug!(backend_pid, error = %e, "Session cleanup failed");
                        }
                        shutdown_reply = Some(reply);
                        break;
                    }
                    None => {
                        debug!(backend_pid, "Client dropped, closing session");
                        break;
                    }
                }
            }
        }
    }

    drop(listener);
    pool.close().await;

    info!(backend_pid, "Notification session closed");
    let _ = events.send(ClientEvent::End { backend_pid });

    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}
